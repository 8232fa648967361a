//! Async runtime: one tokio task per link.
//!
//! [`spawn_link`] moves a [`LinkController`] into its own task, which ticks it
//! on a fixed interval. The caller talks to the task only through a
//! [`LinkHandle`]: commands go in over an `mpsc` channel, and everything the
//! link produces (wire bytes, sideband requests, events, readiness of
//! delivered flits) comes back as [`LinkOutput`] on a second channel. Links
//! never share state.
//!
//! The task never waits on the output channel. When it is full, outputs stay
//! queued inside the controller and the task keeps ticking and answering
//! commands. Delivered flits stay in the controller until the consumer pulls
//! them with [`LinkHandle::recv`], so receive credits are returned at the pace
//! the consumer reads.

use std::time::Duration;

use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info};

use crate::arbiter::ChannelId;
use crate::core::{LinkError, LinkResult};
use crate::flit::{Flit, FlitType};
use crate::link::{
    LinkController, LinkEvent, LinkStatus, LowPowerState, SidebandMessage, SidebandRequest,
};

/// Default capacity of the command and output channels.
pub const CHANNEL_CAPACITY: usize = 1024;

/// Something produced by a link task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkOutput {
    /// Flit bytes for the physical layer.
    Transmit(Vec<u8>),
    /// Request for the sideband collaborator.
    Sideband(SidebandRequest),
    /// Link event.
    Event(LinkEvent),
    /// Delivered flits are waiting on the channel. Sent once until the
    /// channel has been drained with [`LinkHandle::recv`].
    Readable(ChannelId),
}

enum Command {
    Submit {
        channel: ChannelId,
        flit_type: FlitType,
        payload: Vec<u8>,
        reply: oneshot::Sender<LinkResult<()>>,
    },
    Receive(Vec<u8>),
    Recv {
        channel: ChannelId,
        reply: oneshot::Sender<LinkResult<Option<Flit>>>,
    },
    Sideband(SidebandMessage),
    LowPower {
        target: LowPowerState,
        reply: oneshot::Sender<LinkResult<()>>,
    },
    Status(oneshot::Sender<LinkStatus>),
    Shutdown,
}

/// Handle to a running link task.
#[derive(Debug)]
pub struct LinkHandle {
    cmd_tx: mpsc::Sender<Command>,
    out_rx: mpsc::Receiver<LinkOutput>,
    task: Option<JoinHandle<()>>,
}

impl std::fmt::Debug for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Submit { channel, .. } => write!(f, "Submit({channel})"),
            Self::Receive(bytes) => write!(f, "Receive({} bytes)", bytes.len()),
            Self::Recv { channel, .. } => write!(f, "Recv({channel})"),
            Self::Sideband(msg) => write!(f, "Sideband({msg:?})"),
            Self::LowPower { target, .. } => write!(f, "LowPower({target:?})"),
            Self::Status(_) => f.write_str("Status"),
            Self::Shutdown => f.write_str("Shutdown"),
        }
    }
}

/// Run `controller` in its own task, ticking every `tick_interval`.
pub fn spawn_link(controller: LinkController, tick_interval: Duration) -> LinkHandle {
    spawn_link_with_capacity(controller, tick_interval, CHANNEL_CAPACITY)
}

/// Like [`spawn_link`], with `capacity` slots in the command and output
/// channels.
pub fn spawn_link_with_capacity(
    controller: LinkController,
    tick_interval: Duration,
    capacity: usize,
) -> LinkHandle {
    let (cmd_tx, cmd_rx) = mpsc::channel(capacity.max(1));
    let (out_tx, out_rx) = mpsc::channel(capacity.max(1));

    let task = LinkTask {
        readable: vec![false; controller.config().channels.len()],
        link: controller,
        out_tx,
    };
    let task = tokio::spawn(task.run(tick_interval, cmd_rx));

    LinkHandle {
        cmd_tx,
        out_rx,
        task: Some(task),
    }
}

struct LinkTask {
    link: LinkController,
    out_tx: mpsc::Sender<LinkOutput>,
    /// Channels announced as readable and not yet drained.
    readable: Vec<bool>,
}

impl LinkTask {
    async fn run(mut self, tick_interval: Duration, mut cmd_rx: mpsc::Receiver<Command>) {
        let mut interval = tokio::time::interval(tick_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(?tick_interval, "link task started");

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.link.tick();
                    if !self.flush_outputs() {
                        debug!("output receiver dropped, stopping link task");
                        break;
                    }
                }
                cmd = cmd_rx.recv() => {
                    match cmd {
                        Some(Command::Shutdown) | None => break,
                        Some(cmd) => self.handle_command(cmd),
                    }
                }
            }
        }

        info!(cycle = self.link.cycle(), state = %self.link.state(), "link task stopped");
    }

    fn handle_command(&mut self, cmd: Command) {
        let link = &mut self.link;
        match cmd {
            Command::Submit {
                channel,
                flit_type,
                payload,
                reply,
            } => {
                let _ = reply.send(link.submit(channel, flit_type, &payload));
            }
            Command::Receive(bytes) => link.push_received(bytes),
            Command::Recv { channel, reply } => {
                let result = link.recv(channel);
                if link.pending(channel) == 0 {
                    if let Some(flag) = self.readable.get_mut(channel.index()) {
                        *flag = false;
                    }
                }
                let _ = reply.send(result);
            }
            Command::Sideband(msg) => link.handle_sideband(msg),
            Command::LowPower { target, reply } => {
                let _ = reply.send(link.request_low_power(target));
            }
            Command::Status(reply) => {
                let _ = reply.send(link.status());
            }
            Command::Shutdown => {}
        }
    }

    /// Move outputs into the output channel while it has room. Returns
    /// `false` once the receiver is gone.
    fn flush_outputs(&mut self) -> bool {
        let out_tx = self.out_tx.clone();
        loop {
            let permit = match out_tx.try_reserve() {
                Ok(permit) => permit,
                Err(TrySendError::Full(())) => return true,
                Err(TrySendError::Closed(())) => return false,
            };
            match self.next_output() {
                Some(output) => permit.send(output),
                None => return true,
            }
        }
    }

    fn next_output(&mut self) -> Option<LinkOutput> {
        if let Some(bytes) = self.link.poll_transmit() {
            return Some(LinkOutput::Transmit(bytes));
        }
        if let Some(request) = self.link.poll_sideband() {
            return Some(LinkOutput::Sideband(request));
        }
        if let Some(event) = self.link.poll_event() {
            return Some(LinkOutput::Event(event));
        }

        for (idx, announced) in self.readable.iter_mut().enumerate() {
            let channel = ChannelId(idx as u8);
            if !*announced && self.link.pending(channel) > 0 {
                *announced = true;
                return Some(LinkOutput::Readable(channel));
            }
        }
        None
    }
}

impl LinkHandle {
    async fn send(&self, cmd: Command) -> LinkResult<()> {
        self.cmd_tx.send(cmd).await.map_err(|_| LinkError::Closed)
    }

    /// Queue a flit for transmission.
    pub async fn submit(&self, channel: ChannelId, flit_type: FlitType, payload: Vec<u8>) -> LinkResult<()> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Submit {
            channel,
            flit_type,
            payload,
            reply,
        })
        .await?;
        rx.await.map_err(|_| LinkError::Closed)?
    }

    /// Hand bytes from the physical layer to the link.
    pub async fn push_received(&self, bytes: Vec<u8>) -> LinkResult<()> {
        self.send(Command::Receive(bytes)).await
    }

    /// Deliver a sideband primitive.
    pub async fn sideband(&self, msg: SidebandMessage) -> LinkResult<()> {
        self.send(Command::Sideband(msg)).await
    }

    /// Pull the next delivered flit on `channel`, returning its credit to
    /// the peer.
    pub async fn recv(&self, channel: ChannelId) -> LinkResult<Option<Flit>> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Recv { channel, reply }).await?;
        rx.await.map_err(|_| LinkError::Closed)?
    }

    /// Start draining toward a low-power state.
    pub async fn request_low_power(&self, target: LowPowerState) -> LinkResult<()> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::LowPower { target, reply }).await?;
        rx.await.map_err(|_| LinkError::Closed)?
    }

    /// Query a status snapshot.
    pub async fn status(&self) -> LinkResult<LinkStatus> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Status(reply)).await?;
        rx.await.map_err(|_| LinkError::Closed)
    }

    /// Wait for the next output. Returns `None` once the task has stopped
    /// and all outputs were read.
    pub async fn next_output(&mut self) -> Option<LinkOutput> {
        self.out_rx.recv().await
    }

    /// A cloneable sender for feeding wire bytes from another task.
    pub fn wire_sender(&self) -> WireSender {
        WireSender {
            cmd_tx: self.cmd_tx.clone(),
        }
    }

    /// Stop the task and wait for it to finish.
    pub async fn shutdown(mut self) -> LinkResult<()> {
        let _ = self.cmd_tx.send(Command::Shutdown).await;
        if let Some(task) = self.task.take() {
            task.await.map_err(|_| LinkError::Closed)?;
        }
        Ok(())
    }
}

/// Feeds received wire bytes into a link task.
#[derive(Debug, Clone)]
pub struct WireSender {
    cmd_tx: mpsc::Sender<Command>,
}

impl WireSender {
    /// Hand bytes from the physical layer to the link.
    pub async fn push(&self, bytes: Vec<u8>) -> LinkResult<()> {
        self.cmd_tx
            .send(Command::Receive(bytes))
            .await
            .map_err(|_| LinkError::Closed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::LinkConfig;
    use crate::flit::{ControlFlit, FlitCodec, FlitHeader, ProtocolId, SequenceNumber};
    use crate::link::LinkState;

    const CH0: ChannelId = ChannelId(0);

    /// Answer sideband requests until the link reports ACTIVE.
    async fn train(handle: &mut LinkHandle) {
        while let Some(output) = handle.next_output().await {
            match output {
                LinkOutput::Sideband(req) => {
                    if let Some(resp) = req.expected_response() {
                        handle.sideband(resp).await.unwrap();
                    }
                }
                LinkOutput::Event(LinkEvent::StateChanged {
                    to: LinkState::Active,
                    ..
                }) => return,
                _ => {}
            }
        }
        panic!("link task stopped before training completed");
    }

    /// A PCIe data flit as a peer in session zero would send it.
    fn data_flit(seq: u8) -> Vec<u8> {
        let mut header = FlitHeader::new(ProtocolId::Pcie, 0, FlitType::Single);
        header.sequence = SequenceNumber::new(seq);
        FlitCodec::default().encode(header, &[seq]).unwrap()
    }

    /// Read outputs for up to `wait`, returning the count of the first credit
    /// return seen.
    async fn credit_return_within(handle: &mut LinkHandle, wait: Duration) -> Option<u8> {
        let codec = FlitCodec::default();
        let deadline = tokio::time::Instant::now() + wait;
        while let Ok(Some(output)) = tokio::time::timeout_at(deadline, handle.next_output()).await {
            if let LinkOutput::Transmit(bytes) = output {
                let flit = codec.decode(&bytes).unwrap();
                if let Ok(ControlFlit::CreditReturn { count, .. }) = ControlFlit::from_flit(&flit) {
                    return Some(count);
                }
            }
        }
        None
    }

    #[tokio::test]
    async fn test_link_task_trains_and_reports_status() {
        let link = LinkController::new(LinkConfig::default()).unwrap();
        let mut handle = spawn_link(link, Duration::from_millis(1));

        train(&mut handle).await;

        let status = handle.status().await.unwrap();
        assert_eq!(status.state, LinkState::Active);
        assert!(status.cycle > 0);

        handle.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_submit_before_active_is_rejected() {
        let link = LinkController::new(LinkConfig::default()).unwrap();
        let handle = spawn_link(link, Duration::from_secs(3600));

        let err = handle
            .submit(ChannelId(0), FlitType::Single, vec![1])
            .await
            .unwrap_err();
        assert!(err.is_recoverable());

        handle.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_two_tasks_exchange_flits() {
        let mut a = spawn_link(
            LinkController::new(LinkConfig::default()).unwrap(),
            Duration::from_millis(1),
        );
        let mut b = spawn_link(
            LinkController::new(LinkConfig::default()).unwrap(),
            Duration::from_millis(1),
        );
        train(&mut a).await;
        train(&mut b).await;

        let to_a = a.wire_sender();
        let to_b = b.wire_sender();
        for i in 0..4u8 {
            a.submit(ChannelId(1), FlitType::Single, vec![i]).await.unwrap();
        }

        let mut received = Vec::new();
        while received.len() < 4 {
            let (from_a, output) = tokio::select! {
                Some(out) = a.next_output() => (true, out),
                Some(out) = b.next_output() => (false, out),
            };
            match (from_a, output) {
                (true, LinkOutput::Transmit(bytes)) => to_b.push(bytes).await.unwrap(),
                (false, LinkOutput::Transmit(bytes)) => to_a.push(bytes).await.unwrap(),
                (false, LinkOutput::Readable(channel)) => {
                    assert_eq!(channel, ChannelId(1));
                    while let Some(flit) = b.recv(channel).await.unwrap() {
                        received.push(flit.payload[0]);
                    }
                }
                _ => {}
            }
        }
        assert_eq!(received, vec![0, 1, 2, 3]);

        a.shutdown().await.unwrap();
        b.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_unread_outputs_do_not_stall_the_task() {
        let link = LinkController::new(LinkConfig::default()).unwrap();
        let mut handle = spawn_link_with_capacity(link, Duration::from_millis(1), 4);
        train(&mut handle).await;

        // Nobody reads outputs from here on; ACKs pile up past capacity
        let wire = handle.wire_sender();
        for seq in 0..200u8 {
            wire.push(data_flit(seq)).await.unwrap();
            if seq % 10 == 0 {
                tokio::time::sleep(Duration::from_millis(3)).await;
            }
        }
        tokio::time::sleep(Duration::from_millis(20)).await;

        let status = tokio::time::timeout(Duration::from_secs(2), handle.status())
            .await
            .expect("link task stopped answering")
            .unwrap();
        assert_eq!(status.state, LinkState::Active);
        assert!(status.channel(CH0).unwrap().received > 0);

        let first = tokio::time::timeout(Duration::from_secs(2), handle.recv(CH0))
            .await
            .expect("link task stopped answering")
            .unwrap()
            .unwrap();
        assert_eq!(first.payload[0], 0);

        tokio::time::timeout(Duration::from_secs(2), handle.shutdown())
            .await
            .expect("shutdown stalled")
            .unwrap();
    }

    #[tokio::test]
    async fn test_credit_returned_only_after_consumer_reads() {
        let link = LinkController::new(LinkConfig::default()).unwrap();
        let mut handle = spawn_link(link, Duration::from_millis(1));
        train(&mut handle).await;

        for seq in 0..3 {
            handle.push_received(data_flit(seq)).await.unwrap();
        }
        loop {
            match handle.next_output().await.unwrap() {
                LinkOutput::Readable(channel) => {
                    assert_eq!(channel, CH0);
                    break;
                }
                LinkOutput::Transmit(bytes) => {
                    let flit = FlitCodec::default().decode(&bytes).unwrap();
                    assert!(!matches!(
                        ControlFlit::from_flit(&flit),
                        Ok(ControlFlit::CreditReturn { .. })
                    ));
                }
                _ => {}
            }
        }

        // Delivered but unread: the credits stay with the receiver
        assert_eq!(credit_return_within(&mut handle, Duration::from_millis(50)).await, None);
        assert_eq!(handle.status().await.unwrap().channel(CH0).unwrap().received, 3);

        let flit = handle.recv(CH0).await.unwrap().unwrap();
        assert_eq!(flit.payload[0], 0);
        assert_eq!(credit_return_within(&mut handle, Duration::from_secs(1)).await, Some(1));
        assert_eq!(handle.status().await.unwrap().channel(CH0).unwrap().received, 2);

        handle.shutdown().await.unwrap();
    }
}

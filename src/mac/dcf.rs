//! Distributed coordination function MAC.
//!
//! Contention-based channel access with physical and virtual carrier
//! sensing: frames below the RTS/CTS threshold go out as DATA/ACK
//! exchanges, larger ones as RTS/CTS/DATA/ACK, broadcasts without any
//! handshake. Overheard exchanges are deferred to via the NAV; interrupted
//! backoff is resumed, not redrawn.
//!
//! The machine is a pure reactive handler: the host delivers frames, sense
//! results, transmission completions and timer expiries, and every wait is
//! a scheduling request against the host. Exactly one frame is in flight at
//! any time.

use bytes::Bytes;
use log::{debug, error, info, trace, warn};
use rand_core::RngCore;

use crate::backoff::BackoffEngine;
use crate::config::DcfConfig;
use crate::error::{DropReason, Error};
use crate::frame::{
    Address, Frame, FrameKind, RxInfo, HEADER_BITRATE, LENGTH_ACK, LENGTH_CTS, LENGTH_RTS,
    MAC_HEADER_BITS, MAX_FRAME_BITS, PHY_HEADER_BITS,
};
use crate::nav::Nav;
use crate::neighbors::NeighborCache;
use crate::phy::{ChannelState, Phy, RadioState, SenseHandle, Signal};
use crate::queue::TxQueue;
use crate::timer::{Scheduler, TimerHandle, TimerKind};
use crate::upper::UpperLayer;
use crate::SimTime;

/// Guard added to response timeouts so a reply landing exactly on the
/// deadline is still seen before the timer fires
const DELTA: SimTime = 1e-9;

/// DCF protocol states
#[derive(Clone, Copy, Debug, PartialEq, Eq, strum::Display)]
pub enum State {
    /// Nothing to send, nothing in progress
    Idle,
    /// Battling for the channel
    Contend,
    /// RTS sent, awaiting CTS
    WaitCts,
    /// CTS sent, awaiting DATA
    WaitData,
    /// DATA sent, awaiting ACK
    WaitAck,
    /// Locally transmitting an ACK or a broadcast
    Busy,
    /// Deferring while another exchange owns the channel
    Quiet,
}

/// Per-instance counters
#[derive(Clone, Debug, Default, PartialEq)]
pub struct DcfStats {
    pub tx_attempts: u32,
    pub tx_acknowledged: u32,
    pub drops_queue_full: u32,
    pub drops_retry_limit: u32,
    pub duplicates_suppressed: u32,
    pub nav_deferrals: u32,
    pub channel_errors: u32,
}

/// Outstanding contention sense request
#[derive(Clone, Copy, Debug, PartialEq)]
struct SenseRequest {
    handle: SenseHandle,
    started: SimTime,
    timeout: SimTime,
}

/// Pending SIFS wait, holding the frame being answered
#[derive(Clone, Debug, PartialEq)]
struct SifsWait {
    handle: SenseHandle,
    frame: Frame,
    info: RxInfo,
}

/// DCF MAC state machine.
///
/// Generic over the PHY (P), upper layer (U), host scheduler (S) and random
/// generator (R); all collaborators are injected at construction, one
/// machine per simulated node.
pub struct Dcf<P, U, S, R> {
    address: Address,
    config: DcfConfig,

    state: State,
    seq: u16,
    next_is_broadcast: bool,
    broadcast_in_flight: bool,
    switching: bool,

    queue: TxQueue,
    backoff: BackoffEngine,
    nav: Nav,
    neighbors: NeighborCache,

    /// Deferral served ahead of the backoff: DIFS, or EIFS after an error
    current_ifs: SimTime,

    contention: Option<SenseRequest>,
    sifs: Option<SifsWait>,
    timeout: Option<TimerHandle>,
    nav_timer: Option<TimerHandle>,

    stats: DcfStats,

    phy: P,
    upper: U,
    scheduler: S,
    rng: R,
}

impl<P, U, S, R> Dcf<P, U, S, R>
where
    P: Phy,
    U: UpperLayer,
    S: Scheduler,
    R: RngCore,
{
    /// Create a new machine over the given collaborators.
    ///
    /// Validates the configuration, draws an initial backoff and starts
    /// watching the channel, so a freshly booted node contends politely.
    pub fn new(
        address: Address,
        config: DcfConfig,
        phy: P,
        upper: U,
        scheduler: S,
        mut rng: R,
    ) -> Result<Self, Error> {
        config.validate()?;

        let mut seq = (rng.next_u32() & 0x7fff) as u16;
        if seq == 0 {
            seq = 1;
        }

        let mut mac = Self {
            address,
            state: State::Idle,
            seq,
            next_is_broadcast: false,
            broadcast_in_flight: false,
            switching: false,

            queue: TxQueue::new(config.queue_capacity),
            backoff: BackoffEngine::new(&config),
            nav: Nav::new(),
            neighbors: NeighborCache::new(&config),

            current_ifs: config.eifs,

            contention: None,
            sifs: None,
            timeout: None,
            nav_timer: None,

            stats: DcfStats::default(),

            config,
            phy,
            upper,
            scheduler,
            rng,
        };

        mac.backoff.draw(&mut mac.rng, true);
        let window = mac.current_ifs + mac.backoff.remaining();
        mac.sense_channel_while_idle(window)?;

        info!("MAC {} ready, sensing for {} s", mac.address, window);

        Ok(mac)
    }

    pub fn address(&self) -> Address {
        self.address
    }

    pub fn state(&self) -> State {
        self.state
    }

    pub fn stats(&self) -> DcfStats {
        self.stats.clone()
    }

    pub fn queue_len(&self) -> usize {
        self.queue.len()
    }

    /// Accept an outgoing payload from the upper layer.
    ///
    /// Payloads longer than the link maximum are rejected (fragmentation is
    /// not supported). A full queue rejects the payload and reports it
    /// upward as dropped. Otherwise the frame is appended and, if the
    /// machine is idle, a new contention cycle begins.
    pub fn enqueue(&mut self, dest: Address, payload: Bytes) -> Result<(), Error> {
        let bits = MAC_HEADER_BITS + 8 * payload.len() as u32;
        if bits > MAX_FRAME_BITS {
            return Err(Error::FrameTooLong {
                bits,
                max: MAX_FRAME_BITS,
            });
        }

        let sequence = self.next_sequence();
        let frame = if dest.is_broadcast() {
            Frame::broadcast(self.address, sequence, payload)
        } else {
            Frame::data(self.address, dest, sequence, payload)
        };

        match self.queue.enqueue(frame) {
            Ok(()) => {
                debug!(
                    "frame {} for {} enqueued, {} waiting",
                    sequence,
                    dest,
                    self.queue.len()
                );

                if self.state == State::Idle && self.sifs.is_none() {
                    self.begin_new_cycle()?;
                }

                Ok(())
            }
            Err(frame) => {
                warn!("queue full, rejecting frame for {}", dest);
                self.stats.drops_queue_full += 1;
                self.upper
                    .dropped(dest, frame.into_payload(), DropReason::QueueFull);

                Err(Error::QueueFull)
            }
        }
    }

    /// Handle a frame delivered by the PHY (reception complete), with its
    /// decider metadata
    pub fn handle_frame(&mut self, frame: Frame, info: RxInfo) -> Result<(), Error> {
        if self.phy.radio_state() != RadioState::Rx {
            debug!(
                "{} from {} discarded, radio not receiving (switch race)",
                frame.kind, frame.src
            );
            return Ok(());
        }

        trace!(
            "{} from {} for {} in state {}",
            frame.kind,
            frame.src,
            frame.dest,
            self.state
        );

        let now = self.scheduler.now();
        self.neighbors.observe(frame.src, info.snr, now);

        // The channel carried this frame, so an outstanding contention sense
        // has lost; normally the busy result arrives first, but tolerate the
        // host delivering the frame ahead of it.
        if let Some(request) = self.contention.take() {
            debug!("contention sense outstanding at frame delivery, suspending");
            self.phy.cancel_sense(request.handle);
            self.suspend_contention(&request);
        }

        // a decodable frame ends any extended deferral
        self.current_ifs = self.config.difs;

        if frame.dest == self.address {
            self.handle_frame_for_me(frame, info)
        } else if frame.dest.is_broadcast() {
            self.handle_broadcast_frame(frame)
        } else {
            self.handle_frame_not_for_me(frame.duration)
        }
    }

    /// A corrupted reception (collision or bit error) reported by the PHY.
    /// Defers with EIFS instead of DIFS; a broken reply ends the pending
    /// CTS/ACK wait as a failed attempt.
    pub fn handle_channel_error(&mut self) -> Result<(), Error> {
        if self.phy.radio_state() != RadioState::Rx {
            debug!("channel error discarded, radio not receiving (switch race)");
            return Ok(());
        }

        self.stats.channel_errors += 1;

        if let Some(request) = self.contention.take() {
            debug!("contention sense outstanding at error delivery, suspending");
            self.phy.cancel_sense(request.handle);
            self.suspend_contention(&request);
        }

        if self.state == State::WaitCts {
            self.cancel_timeout_expected("CTS wait without an armed timeout")?;
            self.rts_transmission_failed();
        } else if self.state == State::WaitAck {
            self.cancel_timeout_expected("ACK wait without an armed timeout")?;
            self.data_transmission_failed();
        }

        self.current_ifs = self.config.eifs;

        self.begin_new_cycle()
    }

    /// The PHY finished putting our frame on the air
    pub fn handle_tx_complete(&mut self) -> Result<(), Error> {
        trace!("transmission complete in state {}", self.state);

        self.set_radio(RadioState::Rx);

        match self.state {
            State::Busy => {
                if self.broadcast_in_flight {
                    // the broadcast leaves the queue once it is fully on
                    // the air, without consuming any retry budget
                    if self.queue.pop_head().is_none() {
                        return Err(Error::Violation("broadcast completion with an empty queue"));
                    }
                    self.broadcast_in_flight = false;
                    self.backoff.reset_retries();
                    self.backoff.draw(&mut self.rng, true);
                }

                self.begin_new_cycle()
            }
            // the CTS is out; the DATA frame is accepted from IDLE/CONTEND
            // once it arrives
            State::WaitData => self.begin_new_cycle(),
            // reply timers are already running
            State::WaitCts | State::WaitAck => Ok(()),
            _ => Err(Error::Violation(
                "transmission completed in an unexpected state",
            )),
        }
    }

    /// The PHY finished a requested radio mode change
    pub fn handle_switch_complete(&mut self) -> Result<(), Error> {
        trace!("radio switch complete, now {}", self.phy.radio_state());
        self.switching = false;

        Ok(())
    }

    /// Outcome of an outstanding channel sense request: the channel stayed
    /// idle for the whole window, or turned busy first
    pub fn handle_sense_result(
        &mut self,
        handle: SenseHandle,
        result: ChannelState,
    ) -> Result<(), Error> {
        if self.contention.map(|request| request.handle) == Some(handle) {
            let request = self.contention.take().unwrap();
            return self.contention_sense_done(request, result);
        }

        if self.sifs.as_ref().map(|wait| wait.handle) == Some(handle) {
            let wait = self.sifs.take().unwrap();
            return self.sifs_done(wait, result);
        }

        Err(Error::Violation("sense result for an unknown request"))
    }

    /// A timer armed through the host scheduler expired
    pub fn handle_timer(&mut self, kind: TimerKind) -> Result<(), Error> {
        trace!("{} timer fired in state {}", kind, self.state);

        match kind {
            TimerKind::Timeout => self.handle_timeout_expired(),
            TimerKind::Nav => self.handle_nav_expired(),
        }
    }

    fn handle_frame_for_me(&mut self, frame: Frame, info: RxInfo) -> Result<(), Error> {
        match self.state {
            State::Idle | State::Contend => match frame.kind {
                FrameKind::Rts => self.handle_rts_frame(frame, info),
                FrameKind::Data => self.handle_data_frame(frame, info),
                FrameKind::Cts => {
                    // its timeout was processed first in the same quantum
                    warn!("late CTS from {} discarded", frame.src);
                    self.begin_new_cycle()
                }
                _ => Err(Error::Violation(
                    "unexpected control frame while idle or contending",
                )),
            },
            State::WaitData => match frame.kind {
                FrameKind::Data => self.handle_data_frame(frame, info),
                _ => {
                    warn!(
                        "unexpected {} while awaiting DATA, probably an RTS collision",
                        frame.kind
                    );
                    Ok(())
                }
            },
            State::WaitAck => match frame.kind {
                FrameKind::Ack => self.handle_ack_frame(frame),
                _ => Err(Error::Violation("unexpected frame while awaiting ACK")),
            },
            State::WaitCts => match frame.kind {
                FrameKind::Cts => {
                    if self.queue.head().map(|head| head.dest) == Some(frame.src) {
                        self.handle_cts_frame(frame, info)
                    } else {
                        warn!("CTS from {} does not match the current attempt", frame.src);
                        Ok(())
                    }
                }
                _ => {
                    warn!("unexpected {} while awaiting CTS, discarded", frame.kind);
                    Ok(())
                }
            },
            State::Quiet => {
                // deferring nodes take no part in exchanges
                debug!("{} from {} ignored while deferring", frame.kind, frame.src);
                Ok(())
            }
            State::Busy => {
                if self.switching {
                    debug!("{} from {} dropped during radio switchover", frame.kind, frame.src);
                    Ok(())
                } else {
                    Err(Error::Violation("frame received while locally transmitting"))
                }
            }
        }
    }

    /// An RTS addressed to us: answer with a CTS one SIFS later
    fn handle_rts_frame(&mut self, frame: Frame, info: RxInfo) -> Result<(), Error> {
        self.schedule_sifs_response(frame, info)
    }

    /// A DATA frame addressed to us: deliver upward unless it repeats the
    /// last sequence number from that peer, then acknowledge either way so
    /// the sender stops retrying
    fn handle_data_frame(&mut self, frame: Frame, info: RxInfo) -> Result<(), Error> {
        match self
            .neighbors
            .check_duplicate(frame.src, frame.sequence, frame.retry)
        {
            None => {
                return Err(Error::Violation(
                    "DATA from a peer missing from the neighbor cache",
                ))
            }
            Some(true) => {
                debug!(
                    "suppressed duplicate DATA {} from {}",
                    frame.sequence, frame.src
                );
                self.stats.duplicates_suppressed += 1;
            }
            Some(false) => {
                self.upper.deliver(frame.src, frame.payload().clone());
            }
        }

        self.schedule_sifs_response(frame, info)
    }

    /// The CTS for our RTS: send the DATA frame one SIFS later
    fn handle_cts_frame(&mut self, frame: Frame, info: RxInfo) -> Result<(), Error> {
        self.cancel_timeout_expected("CTS wait without an armed timeout")?;
        self.backoff.reset_short();

        self.schedule_sifs_response(frame, info)
    }

    /// The ACK for our DATA: the exchange succeeded, advance the queue
    fn handle_ack_frame(&mut self, frame: Frame) -> Result<(), Error> {
        if self.queue.head().map(|head| head.dest) != Some(frame.src) {
            error!("ACK from {} does not match the current attempt", frame.src);
            return Ok(());
        }

        self.cancel_timeout_expected("ACK wait without an armed timeout")?;

        self.backoff.reset_retries();
        self.stats.tx_acknowledged += 1;
        // post-transmission backoff, held for the next contention
        self.backoff.draw(&mut self.rng, true);

        let _ = self.queue.pop_head();

        self.begin_new_cycle()
    }

    /// A broadcast frame: deliver upward, no acknowledgment
    fn handle_broadcast_frame(&mut self, frame: Frame) -> Result<(), Error> {
        if self.state == State::Busy && !self.switching {
            return Err(Error::Violation("frame received while locally transmitting"));
        }

        self.upper.deliver(frame.src, frame.payload().clone());

        if self.state == State::Contend {
            return self.begin_new_cycle();
        }

        Ok(())
    }

    /// A frame between two other nodes. Defer for its declared duration;
    /// a pending CTS/ACK wait is aborted as a failed attempt since the
    /// exchange has lost the channel.
    fn handle_frame_not_for_me(&mut self, duration: SimTime) -> Result<(), Error> {
        let now = self.scheduler.now();

        if duration > 0.0 {
            if self.state == State::Quiet {
                if let Some(deadline) = self.nav.extend(now, duration) {
                    self.cancel_nav_timer();
                    self.arm_nav_timer(deadline - now)?;
                    debug!("NAV extended to {}", deadline);
                }
            } else {
                if let Some(handle) = self.timeout.take() {
                    self.scheduler.cancel(handle);

                    if self.state == State::WaitAck {
                        if let Some(head) = self.queue.head_mut() {
                            head.retry = true;
                        }
                    }
                    if self.state == State::WaitAck || self.state == State::WaitCts {
                        let rtscts = self.head_uses_rts_cts();
                        self.backoff.record_failure(rtscts);
                    }
                }

                match self.nav.extend(now, duration) {
                    Some(deadline) => self.arm_nav_timer(deadline - now)?,
                    None => return Err(Error::Violation("NAV deadline set outside QUIET")),
                }

                self.stats.nav_deferrals += 1;
                self.set_state(State::Quiet);
                debug!("deferring for {} s", duration);
            }
        }

        self.begin_new_cycle()
    }

    fn handle_timeout_expired(&mut self) -> Result<(), Error> {
        if self.timeout.take().is_none() {
            return Err(Error::Violation("timeout expiry with no timeout armed"));
        }

        match self.state {
            State::WaitCts => {
                debug!("CTS timed out");
                self.rts_transmission_failed();
            }
            State::WaitAck => {
                debug!("ACK timed out");
                self.data_transmission_failed();
            }
            _ => {
                return Err(Error::Violation(
                    "response timeout outside WAIT_CTS/WAIT_ACK",
                ))
            }
        }

        self.begin_new_cycle()
    }

    fn handle_nav_expired(&mut self) -> Result<(), Error> {
        if self.nav_timer.take().is_none() {
            return Err(Error::Violation("NAV expiry with no NAV timer armed"));
        }
        if self.state != State::Quiet {
            return Err(Error::Violation("NAV expiry outside QUIET"));
        }

        debug!("NAV expired, re-evaluating the queue");
        self.nav.clear();

        self.begin_new_cycle()
    }

    fn contention_sense_done(
        &mut self,
        request: SenseRequest,
        result: ChannelState,
    ) -> Result<(), Error> {
        if !result.is_idle() {
            self.suspend_contention(&request);
            return Ok(());
        }

        match self.state {
            State::Idle => {
                // post-transmission backoff ran out over an idle channel
                self.backoff.clear_remaining();
                Ok(())
            }
            State::Contend => {
                // the channel is won; the next contention draws afresh
                self.backoff.clear_remaining();
                self.set_radio(RadioState::Tx);

                if self.next_is_broadcast {
                    self.send_broadcast_frame()
                } else if self.head_uses_rts_cts() {
                    self.send_rts_frame()
                } else {
                    self.send_data_frame(None)
                }
            }
            _ => Err(Error::Violation("contention ended outside CONTEND/IDLE")),
        }
    }

    fn sifs_done(&mut self, wait: SifsWait, result: ChannelState) -> Result<(), Error> {
        if !result.is_idle() {
            debug!(
                "channel busy during SIFS, abandoning the {} response",
                wait.frame.kind
            );

            // an already-entered deferral outlives the abandoned response
            if self.state != State::Quiet {
                if self.queue.is_empty() {
                    self.set_state(State::Idle);
                } else {
                    self.set_state(State::Contend);
                }
            }

            return Ok(());
        }

        self.set_radio(RadioState::Tx);

        match wait.frame.kind {
            FrameKind::Rts => self.send_cts_frame(&wait.frame, &wait.info),
            FrameKind::Cts => self.send_data_frame(Some(&wait.info)),
            FrameKind::Data => self.send_ack_frame(&wait.frame, &wait.info),
            _ => Err(Error::Violation(
                "SIFS elapsed with a non-RTS/CTS/DATA frame stored",
            )),
        }
    }

    /// Duplicate the queue head and hand it to the PHY as DATA. Direct
    /// transmissions pick their bitrate from the neighbor cache; responses
    /// to a CTS reuse the CTS reception bitrate.
    fn send_data_frame(&mut self, cts: Option<&RxInfo>) -> Result<(), Error> {
        let mut frame = match self.queue.head() {
            Some(head) => head.clone(),
            None => return Err(Error::Violation("DATA transmission with an empty queue")),
        };

        let bitrate = match cts {
            Some(info) => info.bitrate,
            None => self.retrieve_bitrate(frame.dest),
        };

        if cts.is_none() && self.backoff.short_retries() > 0 {
            frame.retry = true;
        }

        frame.duration = self.config.sifs + self.packet_duration(LENGTH_ACK, bitrate);

        let airtime = self.packet_duration(frame.bit_length(), bitrate);
        self.arm_timeout(self.data_timeout(frame.bit_length(), bitrate))?;

        debug!("sending DATA to {} at {} bit/s", frame.dest, bitrate);
        self.transmit(frame, airtime, bitrate)?;
        self.set_state(State::WaitAck);

        Ok(())
    }

    /// Reserve the channel for the whole four-way exchange with an RTS
    fn send_rts_frame(&mut self) -> Result<(), Error> {
        let (dest, data_bits) = match self.queue.head() {
            Some(head) => (head.dest, head.bit_length()),
            None => return Err(Error::Violation("RTS transmission with an empty queue")),
        };

        let bitrate = self.retrieve_bitrate(dest);

        let mut rts = Frame::rts(self.address, dest);
        rts.duration = 3.0 * self.config.sifs
            + self.packet_duration(LENGTH_CTS, bitrate)
            + self.packet_duration(data_bits, bitrate)
            + self.packet_duration(LENGTH_ACK, bitrate);

        let airtime = self.packet_duration(LENGTH_RTS, bitrate);
        self.arm_timeout(self.rts_timeout(bitrate))?;

        debug!("sending RTS to {} reserving {} s", dest, rts.duration);
        self.transmit(rts, airtime, bitrate)?;
        self.set_state(State::WaitCts);

        Ok(())
    }

    /// Answer an RTS, carrying over the remainder of its reservation
    fn send_cts_frame(&mut self, rts: &Frame, info: &RxInfo) -> Result<(), Error> {
        let bitrate = info.bitrate;
        let airtime = self.packet_duration(LENGTH_CTS, bitrate);

        let mut cts = Frame::cts(self.address, rts.src);
        cts.duration = rts.duration - self.config.sifs - airtime;

        debug!("sending CTS to {}", cts.dest);
        self.transmit(cts, airtime, bitrate)?;
        self.set_state(State::WaitData);

        Ok(())
    }

    /// Acknowledge a DATA frame
    fn send_ack_frame(&mut self, data: &Frame, info: &RxInfo) -> Result<(), Error> {
        let bitrate = info.bitrate;
        let ack = Frame::ack(self.address, data.src);
        let airtime = self.packet_duration(LENGTH_ACK, bitrate);

        debug!("sending ACK to {}", data.src);
        self.transmit(ack, airtime, bitrate)?;
        self.set_state(State::Busy);

        Ok(())
    }

    /// Duplicate the queue head and put it on the air without a handshake
    fn send_broadcast_frame(&mut self) -> Result<(), Error> {
        let frame = match self.queue.head() {
            Some(head) => head.clone(),
            None => return Err(Error::Violation("broadcast transmission with an empty queue")),
        };

        let bitrate = self.retrieve_bitrate(frame.dest);
        let airtime = self.packet_duration(frame.bit_length(), bitrate);

        debug!("sending BROADCAST, {} bits", frame.bit_length());
        self.transmit(frame, airtime, bitrate)?;
        self.broadcast_in_flight = true;
        self.set_state(State::Busy);

        Ok(())
    }

    /// Start a new contention cycle if the channel is free and there is
    /// something to send. Called at the end of deferrals, busy periods and
    /// failures.
    fn begin_new_cycle(&mut self) -> Result<(), Error> {
        self.test_retry_limit();

        if self.nav.is_set() {
            debug!("cannot begin a new cycle until the NAV expires");
            return Ok(());
        }

        if !self.queue.is_empty() {
            self.next_is_broadcast = self
                .queue
                .head()
                .map(|head| head.dest.is_broadcast())
                .unwrap_or(false);

            self.set_state(State::Contend);

            if self.contention.is_none() && self.phy.channel_state().is_idle() {
                let window = self.current_ifs + self.backoff.remaining();
                self.sense_channel_while_idle(window)?;
            }

            Ok(())
        } else {
            // serve a pending post-transmission backoff even while idle
            if self.backoff.remaining() > 0.0
                && self.contention.is_none()
                && self.phy.channel_state().is_idle()
            {
                let window = self.current_ifs + self.backoff.remaining();
                self.sense_channel_while_idle(window)?;
            }

            self.set_state(State::Idle);

            Ok(())
        }
    }

    /// Drop the head frame once either retry budget is exhausted
    fn test_retry_limit(&mut self) {
        if !self.backoff.limit_reached() {
            return;
        }

        debug!(
            "retry limit reached, short {} long {}",
            self.backoff.short_retries(),
            self.backoff.long_retries()
        );

        self.backoff.reset_retries();

        if let Some(frame) = self.queue.pop_head() {
            self.stats.drops_retry_limit += 1;
            self.upper
                .dropped(frame.dest, frame.into_payload(), DropReason::RetryLimit);
        }
    }

    fn data_transmission_failed(&mut self) {
        let rtscts = self.head_uses_rts_cts();
        self.backoff.record_failure(rtscts);

        if let Some(head) = self.queue.head_mut() {
            head.retry = true;
        }

        self.backoff.draw(&mut self.rng, rtscts);
    }

    fn rts_transmission_failed(&mut self) {
        self.backoff.record_failure(true);
        self.backoff.draw(&mut self.rng, true);
    }

    /// Credit the elapsed quiet time against the pending backoff after an
    /// interrupted contention; it resumes, it is not redrawn
    fn suspend_contention(&mut self, request: &SenseRequest) {
        let quiet = self.scheduler.now() - request.started;
        self.backoff
            .suspend(request.timeout, quiet, self.current_ifs);
    }

    fn sense_channel_while_idle(&mut self, window: SimTime) -> Result<(), Error> {
        if self.contention.is_some() {
            return Err(Error::Violation(
                "channel sense started while one is outstanding",
            ));
        }

        trace!("sensing the channel for {} s", window);

        let started = self.scheduler.now();
        let handle = self.phy.sense(window);
        self.contention = Some(SenseRequest {
            handle,
            started,
            timeout: window,
        });

        Ok(())
    }

    fn schedule_sifs_response(&mut self, frame: Frame, info: RxInfo) -> Result<(), Error> {
        if self.sifs.is_some() {
            return Err(Error::Violation("SIFS wait already armed"));
        }

        let handle = self.phy.sense(self.config.sifs);
        self.sifs = Some(SifsWait {
            handle,
            frame,
            info,
        });

        Ok(())
    }

    /// Bitrate for a fresh attempt to `dest`: the cached estimate when
    /// adaptive selection applies and the entry is fresh, else the default
    fn retrieve_bitrate(&self, dest: Address) -> f64 {
        if self.config.auto_bitrate
            && !dest.is_broadcast()
            && self.backoff.short_retries() == 0
            && self.backoff.long_retries() == 0
        {
            if let Some(bitrate) = self.neighbors.bitrate_of(dest, self.scheduler.now()) {
                return bitrate;
            }
        }

        self.config.default_bitrate
    }

    fn head_uses_rts_cts(&self) -> bool {
        self.queue
            .head()
            .map(|head| self.uses_rts_cts(head))
            .unwrap_or(false)
    }

    fn uses_rts_cts(&self, frame: &Frame) -> bool {
        frame.kind == FrameKind::Data
            && frame.bit_length() - MAC_HEADER_BITS > self.config.rts_cts_threshold
    }

    /// Airtime of a frame at the given bitrate, including the PHY header
    fn packet_duration(&self, bits: u32, bitrate: f64) -> SimTime {
        bits as f64 / bitrate + PHY_HEADER_BITS as f64 / HEADER_BITRATE
    }

    fn rts_timeout(&self, bitrate: f64) -> SimTime {
        self.config.sifs
            + self.packet_duration(LENGTH_RTS, bitrate)
            + self.config.slot_time
            + self.packet_duration(LENGTH_CTS, bitrate)
            + DELTA
    }

    fn data_timeout(&self, bits: u32, bitrate: f64) -> SimTime {
        self.config.sifs
            + self.packet_duration(bits, bitrate)
            + self.config.slot_time
            + self.packet_duration(LENGTH_ACK, bitrate)
            + DELTA
    }

    /// Hand a frame to the PHY. The radio must already be in TX.
    fn transmit(&mut self, frame: Frame, airtime: SimTime, bitrate: f64) -> Result<(), Error> {
        if self.phy.radio_state() != RadioState::Tx {
            return Err(Error::Violation(
                "frame handed to the PHY while the radio is not in TX",
            ));
        }

        let signal = Signal {
            start: self.scheduler.now(),
            duration: airtime,
            power: self.config.tx_power,
            bitrate,
        };

        self.stats.tx_attempts += 1;
        self.phy.transmit(frame, signal);

        Ok(())
    }

    fn set_radio(&mut self, target: RadioState) {
        if self.phy.radio_state() != target {
            self.phy.set_radio_state(target);
            self.switching = true;
        }
    }

    fn arm_timeout(&mut self, delay: SimTime) -> Result<(), Error> {
        if self.timeout.is_some() {
            return Err(Error::Violation("response timeout already armed"));
        }

        self.timeout = Some(self.scheduler.schedule_after(delay, TimerKind::Timeout));

        Ok(())
    }

    fn cancel_timeout_expected(&mut self, violation: &'static str) -> Result<(), Error> {
        match self.timeout.take() {
            Some(handle) => {
                self.scheduler.cancel(handle);
                Ok(())
            }
            None => Err(Error::Violation(violation)),
        }
    }

    fn arm_nav_timer(&mut self, delay: SimTime) -> Result<(), Error> {
        if self.nav_timer.is_some() {
            return Err(Error::Violation("NAV timer already armed"));
        }

        self.nav_timer = Some(self.scheduler.schedule_after(delay, TimerKind::Nav));

        Ok(())
    }

    fn cancel_nav_timer(&mut self) {
        if let Some(handle) = self.nav_timer.take() {
            self.scheduler.cancel(handle);
        }
    }

    fn next_sequence(&mut self) -> u16 {
        let s = self.seq;
        self.seq = self.seq.wrapping_add(1);
        if self.seq == 0 {
            self.seq = 1;
        }
        s
    }

    fn set_state(&mut self, next: State) {
        if self.state == next {
            trace!("staying in state {}", self.state);
        } else {
            debug!("state {} -> {}", self.state, next);
            self.state = next;
        }
    }
}

#[cfg(test)]
mod test {
    use bytes::Bytes;
    use rand::rngs::mock::StepRng;

    use crate::config::{ConfigError, DcfConfig};
    use crate::phy::mock::{MockPhy, PhyOp};
    use crate::timer::mock::MockScheduler;
    use crate::upper::mock::MockUpper;
    use super::*;

    const ADDR: Address = Address(1);
    const PEER: Address = Address(2);

    type TestDcf = Dcf<MockPhy, MockUpper, MockScheduler, StepRng>;

    fn init_log() {
        let _ = simplelog::SimpleLogger::init(
            log::LevelFilter::Trace,
            simplelog::Config::default(),
        );
    }

    fn info() -> RxInfo {
        RxInfo {
            snr: 15.0,
            bitrate: 2.0e6,
        }
    }

    fn make_with_rng(
        config: DcfConfig,
        rng: StepRng,
    ) -> (TestDcf, MockPhy, MockUpper, MockScheduler) {
        init_log();

        let phy = MockPhy::new();
        let upper = MockUpper::new();
        let scheduler = MockScheduler::new();
        let dcf = Dcf::new(
            ADDR,
            config,
            phy.clone(),
            upper.clone(),
            scheduler.clone(),
            rng,
        )
        .unwrap();

        (dcf, phy, upper, scheduler)
    }

    fn make(config: DcfConfig) -> (TestDcf, MockPhy, MockUpper, MockScheduler) {
        make_with_rng(config, StepRng::new(0, 0))
    }

    /// Resolve the post-boot contention and drain the recorded operations
    fn boot(dcf: &mut TestDcf, phy: &MockPhy) {
        let handle = phy.last_sense().unwrap();
        dcf.handle_sense_result(handle, ChannelState::Idle).unwrap();
        phy.take_ops();
    }

    fn airtime(bits: u32, bitrate: f64) -> f64 {
        bits as f64 / bitrate + PHY_HEADER_BITS as f64 / HEADER_BITRATE
    }

    #[test]
    fn boot_contends_politely() {
        let config = DcfConfig::default();
        let (mut dcf, phy, _upper, _scheduler) =
            make_with_rng(config.clone(), StepRng::new(3, 0));

        assert_eq!(dcf.state(), State::Idle);
        assert_eq!(
            phy.take_ops(),
            vec![PhyOp::Sense(config.eifs + 3.0 * config.slot_time)]
        );

        let handle = phy.last_sense().unwrap();
        dcf.handle_sense_result(handle, ChannelState::Idle).unwrap();

        assert_eq!(dcf.backoff.remaining(), 0.0);
        assert_eq!(dcf.state(), State::Idle);
    }

    #[test]
    fn invalid_config_is_rejected_at_construction() {
        let mut config = DcfConfig::default();
        config.cw_min = 0;

        let result = Dcf::new(
            ADDR,
            config,
            MockPhy::new(),
            MockUpper::new(),
            MockScheduler::new(),
            StepRng::new(0, 0),
        );

        assert!(matches!(
            result,
            Err(Error::Config(ConfigError::ContentionWindow))
        ));
    }

    #[test]
    fn direct_data_exchange() {
        let config = DcfConfig::default();
        let (mut dcf, phy, upper, scheduler) = make(config.clone());
        boot(&mut dcf, &phy);

        dcf.enqueue(PEER, Bytes::from_static(b"hello")).unwrap();
        assert_eq!(dcf.state(), State::Contend);
        // contention over EIFS (nothing received yet) plus zero backoff
        assert_eq!(phy.take_ops(), vec![PhyOp::Sense(config.eifs)]);

        let handle = phy.last_sense().unwrap();
        dcf.handle_sense_result(handle, ChannelState::Idle).unwrap();
        assert_eq!(dcf.state(), State::WaitAck);

        let (frame, signal) = phy.take_transmissions().remove(0);
        assert_eq!(frame.kind, FrameKind::Data);
        assert_eq!(frame.src, ADDR);
        assert_eq!(frame.dest, PEER);
        assert_eq!(frame.retry, false);

        // the DATA frame reserves the channel for SIFS plus the ACK
        let ack_air = airtime(LENGTH_ACK, config.default_bitrate);
        assert!((frame.duration - (config.sifs + ack_air)).abs() < 1e-12);
        assert_eq!(signal.bitrate, config.default_bitrate);
        assert_eq!(signal.power, config.tx_power);

        let armed = scheduler.armed();
        assert_eq!(armed.len(), 1);
        assert_eq!(armed[0].1, TimerKind::Timeout);

        dcf.handle_tx_complete().unwrap();
        assert_eq!(dcf.state(), State::WaitAck);

        dcf.handle_frame(Frame::ack(PEER, ADDR), info()).unwrap();

        assert_eq!(dcf.state(), State::Idle);
        assert_eq!(dcf.queue_len(), 0);
        assert_eq!(dcf.backoff.short_retries(), 0);
        assert_eq!(dcf.backoff.long_retries(), 0);
        assert_eq!(scheduler.cancelled().len(), 1);
        assert!(upper.drops().is_empty());
        assert_eq!(dcf.stats().tx_acknowledged, 1);
    }

    #[test]
    fn rts_cts_exchange_with_cts_timeout() {
        let config = DcfConfig::default();
        let (mut dcf, phy, upper, _scheduler) = make(config.clone());
        boot(&mut dcf, &phy);

        // 800 payload bits, above the 400-bit threshold
        dcf.enqueue(PEER, Bytes::from(vec![0u8; 100])).unwrap();
        let handle = phy.last_sense().unwrap();
        dcf.handle_sense_result(handle, ChannelState::Idle).unwrap();
        assert_eq!(dcf.state(), State::WaitCts);

        let (rts, _signal) = phy.take_transmissions().remove(0);
        assert_eq!(rts.kind, FrameKind::Rts);
        let br = config.default_bitrate;
        let data_bits = MAC_HEADER_BITS + 800;
        let reserved = 3.0 * config.sifs
            + airtime(LENGTH_CTS, br)
            + airtime(data_bits, br)
            + airtime(LENGTH_ACK, br);
        assert!((rts.duration - reserved).abs() < 1e-12);

        dcf.handle_tx_complete().unwrap();

        // the CTS never arrives: one long retry, short counter untouched
        dcf.handle_timer(TimerKind::Timeout).unwrap();

        assert_eq!(dcf.backoff.long_retries(), 1);
        assert_eq!(dcf.backoff.short_retries(), 0);
        assert_eq!(dcf.state(), State::Contend);
        assert_eq!(
            phy.take_ops(),
            vec![
                PhyOp::SetRadioState(RadioState::Rx),
                PhyOp::Sense(config.eifs)
            ]
        );

        // second attempt wins again and the CTS arrives
        let handle = phy.last_sense().unwrap();
        dcf.handle_sense_result(handle, ChannelState::Idle).unwrap();
        dcf.handle_tx_complete().unwrap();
        phy.take_ops();

        dcf.handle_frame(Frame::cts(PEER, ADDR), info()).unwrap();
        assert_eq!(phy.take_ops(), vec![PhyOp::Sense(config.sifs)]);

        let handle = phy.last_sense().unwrap();
        dcf.handle_sense_result(handle, ChannelState::Idle).unwrap();
        assert_eq!(dcf.state(), State::WaitAck);

        let (data, signal) = phy.take_transmissions().remove(0);
        assert_eq!(data.kind, FrameKind::Data);
        // the response goes out at the CTS reception bitrate
        assert_eq!(signal.bitrate, info().bitrate);

        dcf.handle_tx_complete().unwrap();
        dcf.handle_frame(Frame::ack(PEER, ADDR), info()).unwrap();

        assert_eq!(dcf.queue_len(), 0);
        assert_eq!(dcf.state(), State::Idle);
        assert_eq!(dcf.backoff.long_retries(), 0);
        assert!(upper.drops().is_empty());
    }

    #[test]
    fn broadcast_precedes_queued_unicast() {
        let config = DcfConfig::default();
        let (mut dcf, phy, upper, scheduler) = make(config.clone());
        boot(&mut dcf, &phy);

        dcf.enqueue(Address::BROADCAST, Bytes::from_static(b"announce"))
            .unwrap();
        dcf.enqueue(PEER, Bytes::from_static(b"unicast")).unwrap();
        assert_eq!(dcf.queue_len(), 2);

        let handle = phy.last_sense().unwrap();
        dcf.handle_sense_result(handle, ChannelState::Idle).unwrap();
        assert_eq!(dcf.state(), State::Busy);

        let (frame, _signal) = phy.take_transmissions().remove(0);
        assert_eq!(frame.kind, FrameKind::Broadcast);
        assert_eq!(frame.duration, 0.0);
        // no handshake: no response timeout armed
        assert!(scheduler.armed().is_empty());

        dcf.handle_tx_complete().unwrap();

        // the queue advanced to the unicast frame, budgets untouched
        assert_eq!(dcf.queue_len(), 1);
        assert_eq!(dcf.state(), State::Contend);
        assert_eq!(dcf.backoff.short_retries(), 0);
        assert_eq!(dcf.backoff.long_retries(), 0);

        let handle = phy.last_sense().unwrap();
        dcf.handle_sense_result(handle, ChannelState::Idle).unwrap();

        let (data, _signal) = phy.take_transmissions().remove(0);
        assert_eq!(data.kind, FrameKind::Data);
        assert_eq!(data.dest, PEER);
        assert!(upper.drops().is_empty());
    }

    #[test]
    fn interrupted_backoff_resumes_rounded_not_redrawn() {
        let config = DcfConfig::default();
        let slot = config.slot_time;
        // every draw yields five slots of backoff
        let (mut dcf, phy, upper, scheduler) =
            make_with_rng(config.clone(), StepRng::new(5, 0));

        assert_eq!(
            phy.take_ops(),
            vec![PhyOp::Sense(config.eifs + 5.0 * slot)]
        );

        dcf.enqueue(PEER, Bytes::from_static(b"queued")).unwrap();
        assert_eq!(dcf.state(), State::Contend);
        // the outstanding sense is reused, no second request
        assert!(phy.take_ops().is_empty());

        // the channel goes busy half way through the third backoff slot
        scheduler.set_now(config.eifs + 2.5 * slot);
        let handle = phy.last_sense().unwrap();
        dcf.handle_sense_result(handle, ChannelState::Busy).unwrap();

        assert_eq!(dcf.state(), State::Contend);
        assert!((dcf.backoff.remaining() - 3.0 * slot).abs() < 1e-12);

        // the overheard frame arrives and reserves the channel
        let mut overheard = Frame::data(PEER, Address(3), 9, Bytes::from_static(b"x"));
        overheard.duration = 2e-3;
        dcf.handle_frame(overheard, info()).unwrap();
        assert_eq!(dcf.state(), State::Quiet);

        let armed = scheduler.armed();
        assert_eq!(armed.len(), 1);
        assert_eq!(armed[0].1, TimerKind::Nav);
        assert!((armed[0].2 - (config.eifs + 2.5 * slot + 2e-3)).abs() < 1e-12);

        // a shorter overlapping reservation must not shorten the NAV
        scheduler.advance(1e-3);
        let mut second = Frame::data(Address(4), Address(3), 2, Bytes::from_static(b"y"));
        second.duration = 0.5e-3;
        dcf.handle_frame(second, info()).unwrap();
        assert_eq!(scheduler.armed(), armed);

        // NAV expiry resumes the rounded remainder over DIFS, no redraw
        dcf.handle_timer(TimerKind::Nav).unwrap();
        assert_eq!(dcf.state(), State::Contend);
        assert_eq!(
            phy.take_ops(),
            vec![PhyOp::Sense(config.difs + 3.0 * slot)]
        );
        assert!(upper.drops().is_empty());
    }

    #[test]
    fn retry_exhaustion_drops_the_frame_exactly_once() {
        let mut config = DcfConfig::default();
        config.short_retry_limit = 2;
        let (mut dcf, phy, upper, _scheduler) = make(config.clone());
        boot(&mut dcf, &phy);

        let payload = Bytes::from_static(b"doomed");
        dcf.enqueue(PEER, payload.clone()).unwrap();

        let mut attempts = 0;
        while dcf.queue_len() > 0 {
            let handle = phy.last_sense().unwrap();
            dcf.handle_sense_result(handle, ChannelState::Idle).unwrap();
            attempts += 1;
            dcf.handle_tx_complete().unwrap();
            dcf.handle_timer(TimerKind::Timeout).unwrap();
        }

        assert_eq!(attempts, 2);
        assert_eq!(upper.drops(), vec![(PEER, payload, DropReason::RetryLimit)]);
        assert_eq!(dcf.backoff.short_retries(), 0);
        assert_eq!(dcf.state(), State::Idle);
        assert_eq!(dcf.stats().drops_retry_limit, 1);

        // bounded by the sum of the retry budgets
        let bound = (config.short_retry_limit + 1 + config.long_retry_limit + 1) as usize;
        assert!(attempts <= bound);
    }

    #[test]
    fn second_attempt_carries_the_retry_flag() {
        let (mut dcf, phy, _upper, _scheduler) = make(DcfConfig::default());
        boot(&mut dcf, &phy);

        dcf.enqueue(PEER, Bytes::from_static(b"again")).unwrap();
        let handle = phy.last_sense().unwrap();
        dcf.handle_sense_result(handle, ChannelState::Idle).unwrap();
        dcf.handle_tx_complete().unwrap();
        dcf.handle_timer(TimerKind::Timeout).unwrap();

        let handle = phy.last_sense().unwrap();
        dcf.handle_sense_result(handle, ChannelState::Idle).unwrap();

        let transmissions = phy.take_transmissions();
        let (retry, _signal) = transmissions.last().unwrap();
        assert_eq!(retry.kind, FrameKind::Data);
        assert_eq!(retry.retry, true);
        // same queue entry, duplicated per attempt
        assert_eq!(retry.sequence, transmissions[0].0.sequence);
    }

    #[test]
    fn duplicate_data_is_suppressed_but_still_acknowledged() {
        let (mut dcf, phy, upper, _scheduler) = make(DcfConfig::default());
        boot(&mut dcf, &phy);

        let mut data = Frame::data(PEER, ADDR, 9, Bytes::from_static(b"once"));
        dcf.handle_frame(data.clone(), info()).unwrap();
        assert_eq!(upper.delivered().len(), 1);

        // SIFS elapses idle and the ACK goes out
        let handle = phy.last_sense().unwrap();
        dcf.handle_sense_result(handle, ChannelState::Idle).unwrap();
        let (ack, _signal) = phy.take_transmissions().remove(0);
        assert_eq!(ack.kind, FrameKind::Ack);
        assert_eq!(ack.dest, PEER);

        dcf.handle_tx_complete().unwrap();
        assert_eq!(dcf.state(), State::Idle);

        // the ACK was lost and the peer retries the same sequence number
        data.retry = true;
        dcf.handle_frame(data, info()).unwrap();

        assert_eq!(upper.delivered().len(), 1);
        assert_eq!(dcf.stats().duplicates_suppressed, 1);

        // the retry is still acknowledged so the peer stops retrying
        let handle = phy.last_sense().unwrap();
        dcf.handle_sense_result(handle, ChannelState::Idle).unwrap();
        let (ack, _signal) = phy.take_transmissions().remove(0);
        assert_eq!(ack.kind, FrameKind::Ack);
    }

    #[test]
    fn rts_elicits_cts_and_data_is_acknowledged() {
        let config = DcfConfig::default();
        let (mut dcf, phy, upper, _scheduler) = make(config.clone());
        boot(&mut dcf, &phy);

        let mut rts = Frame::rts(PEER, ADDR);
        rts.duration = 2e-3;
        dcf.handle_frame(rts, info()).unwrap();

        let handle = phy.last_sense().unwrap();
        dcf.handle_sense_result(handle, ChannelState::Idle).unwrap();
        assert_eq!(dcf.state(), State::WaitData);

        let (cts, _signal) = phy.take_transmissions().remove(0);
        assert_eq!(cts.kind, FrameKind::Cts);
        assert_eq!(cts.dest, PEER);
        // the CTS carries the remainder of the RTS reservation
        let expected = 2e-3 - config.sifs - airtime(LENGTH_CTS, info().bitrate);
        assert!((cts.duration - expected).abs() < 1e-12);

        dcf.handle_tx_complete().unwrap();
        assert_eq!(dcf.state(), State::Idle);

        dcf.handle_frame(
            Frame::data(PEER, ADDR, 4, Bytes::from_static(b"body")),
            info(),
        )
        .unwrap();
        assert_eq!(upper.delivered().len(), 1);

        let handle = phy.last_sense().unwrap();
        dcf.handle_sense_result(handle, ChannelState::Idle).unwrap();
        let (ack, _signal) = phy.take_transmissions().remove(0);
        assert_eq!(ack.kind, FrameKind::Ack);
    }

    #[test]
    fn busy_sifs_abandons_the_response() {
        let (mut dcf, phy, upper, _scheduler) = make(DcfConfig::default());
        boot(&mut dcf, &phy);

        dcf.handle_frame(
            Frame::data(PEER, ADDR, 4, Bytes::from_static(b"body")),
            info(),
        )
        .unwrap();
        assert_eq!(upper.delivered().len(), 1);

        let handle = phy.last_sense().unwrap();
        dcf.handle_sense_result(handle, ChannelState::Busy).unwrap();

        assert_eq!(dcf.state(), State::Idle);
        assert!(phy.take_transmissions().is_empty());
    }

    #[test]
    fn overheard_frame_aborts_ack_wait() {
        let (mut dcf, phy, _upper, scheduler) = make(DcfConfig::default());
        boot(&mut dcf, &phy);

        dcf.enqueue(PEER, Bytes::from_static(b"small")).unwrap();
        let handle = phy.last_sense().unwrap();
        dcf.handle_sense_result(handle, ChannelState::Idle).unwrap();
        dcf.handle_tx_complete().unwrap();
        assert_eq!(dcf.state(), State::WaitAck);

        let mut overheard = Frame::data(Address(5), Address(6), 1, Bytes::from_static(b"z"));
        overheard.duration = 1e-3;
        dcf.handle_frame(overheard, info()).unwrap();

        assert_eq!(dcf.state(), State::Quiet);
        // the lost exchange counts as a failed attempt
        assert_eq!(dcf.backoff.short_retries(), 1);
        assert_eq!(scheduler.cancelled().len(), 1);
        assert_eq!(dcf.queue.head().unwrap().retry, true);
    }

    #[test]
    fn channel_error_defers_with_eifs() {
        let config = DcfConfig::default();
        let (mut dcf, phy, _upper, _scheduler) = make(config.clone());
        boot(&mut dcf, &phy);

        // a good reception switches the deferral to DIFS
        dcf.handle_frame(
            Frame::data(PEER, ADDR, 3, Bytes::from_static(b"ok")),
            info(),
        )
        .unwrap();
        let handle = phy.last_sense().unwrap();
        dcf.handle_sense_result(handle, ChannelState::Idle).unwrap();
        dcf.handle_tx_complete().unwrap();
        phy.take_ops();

        dcf.enqueue(PEER, Bytes::from_static(b"out")).unwrap();
        assert_eq!(phy.take_ops(), vec![PhyOp::Sense(config.difs)]);

        let handle = phy.last_sense().unwrap();
        dcf.handle_sense_result(handle, ChannelState::Busy).unwrap();

        // the frame never decodes; the next deferral uses EIFS
        dcf.handle_channel_error().unwrap();

        assert_eq!(dcf.state(), State::Contend);
        assert_eq!(phy.take_ops(), vec![PhyOp::Sense(config.eifs)]);
        assert_eq!(dcf.stats().channel_errors, 1);
    }

    #[test]
    fn adaptive_bitrate_uses_fresh_neighbor_estimate_on_first_try() {
        let mut config = DcfConfig::default();
        config.auto_bitrate = true;
        let (mut dcf, phy, _upper, scheduler) = make(config.clone());
        boot(&mut dcf, &phy);

        // hear the peer at high link quality
        let good = RxInfo {
            snr: 90.0,
            bitrate: 1.0e6,
        };
        dcf.handle_frame(
            Frame::data(PEER, ADDR, 2, Bytes::from_static(b"m")),
            good,
        )
        .unwrap();
        let handle = phy.last_sense().unwrap();
        dcf.handle_sense_result(handle, ChannelState::Idle).unwrap();
        dcf.handle_tx_complete().unwrap();
        phy.take_ops();

        dcf.enqueue(PEER, Bytes::from_static(b"reply")).unwrap();
        let handle = phy.last_sense().unwrap();
        dcf.handle_sense_result(handle, ChannelState::Idle).unwrap();

        let (_data, signal) = phy.take_transmissions().remove(0);
        assert_eq!(signal.bitrate, 11.0e6);

        dcf.handle_tx_complete().unwrap();
        dcf.handle_frame(Frame::ack(PEER, ADDR), good).unwrap();

        // a stale estimate falls back to the default bitrate
        scheduler.advance(config.neighbor_max_age + 1.0);
        dcf.enqueue(PEER, Bytes::from_static(b"later")).unwrap();
        let handle = phy.last_sense().unwrap();
        dcf.handle_sense_result(handle, ChannelState::Idle).unwrap();

        let (_data, signal) = phy.take_transmissions().remove(0);
        assert_eq!(signal.bitrate, config.default_bitrate);
    }

    #[test]
    fn queue_overflow_rejects_and_notifies() {
        let mut config = DcfConfig::default();
        config.queue_capacity = 1;
        let (mut dcf, phy, upper, _scheduler) = make(config);
        boot(&mut dcf, &phy);

        dcf.enqueue(PEER, Bytes::from_static(b"first")).unwrap();

        let overflow = Bytes::from_static(b"second");
        assert_eq!(dcf.enqueue(PEER, overflow.clone()), Err(Error::QueueFull));
        assert_eq!(dcf.queue_len(), 1);
        assert_eq!(upper.drops(), vec![(PEER, overflow, DropReason::QueueFull)]);
        assert_eq!(dcf.stats().drops_queue_full, 1);
    }

    #[test]
    fn oversize_payload_is_rejected_at_handoff() {
        let (mut dcf, phy, _upper, _scheduler) = make(DcfConfig::default());
        boot(&mut dcf, &phy);

        let bits = MAC_HEADER_BITS + 8 * 2500;
        assert_eq!(
            dcf.enqueue(PEER, Bytes::from(vec![0u8; 2500])),
            Err(Error::FrameTooLong {
                bits,
                max: MAX_FRAME_BITS
            })
        );
        assert_eq!(dcf.queue_len(), 0);
    }

    #[test]
    fn unexpected_ack_is_a_violation() {
        let (mut dcf, phy, _upper, _scheduler) = make(DcfConfig::default());
        boot(&mut dcf, &phy);

        let result = dcf.handle_frame(Frame::ack(PEER, ADDR), info());

        assert!(matches!(result, Err(Error::Violation(_))));
    }

    #[test]
    fn late_cts_after_its_timeout_restarts_contention() {
        let config = DcfConfig::default();
        let (mut dcf, phy, _upper, _scheduler) = make(config.clone());
        boot(&mut dcf, &phy);

        dcf.enqueue(PEER, Bytes::from(vec![0u8; 100])).unwrap();
        let handle = phy.last_sense().unwrap();
        dcf.handle_sense_result(handle, ChannelState::Idle).unwrap();
        dcf.handle_tx_complete().unwrap();
        dcf.handle_timer(TimerKind::Timeout).unwrap();
        assert_eq!(dcf.state(), State::Contend);

        let pending = phy.last_sense().unwrap();
        phy.take_ops();

        // the CTS shows up anyway: discarded, contention restarted
        assert_eq!(dcf.handle_frame(Frame::cts(PEER, ADDR), info()), Ok(()));
        assert_eq!(dcf.state(), State::Contend);
        assert_eq!(
            phy.take_ops(),
            vec![PhyOp::CancelSense(pending), PhyOp::Sense(config.difs)]
        );
    }
}

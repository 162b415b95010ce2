//! ---
//! ems_section: "01-core-functionality"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Session lifecycle and connection orchestration."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use nalgebra::Vector3;
use serde_json::json;
use teleop_common::time::{duration_to_micros, rtt_estimate_ms, unix_millis};
use teleop_common::{IdlePolicy, LoopTimingReporter, SceneConfig, TeleopMetrics};
use teleop_control::{FilterState, FrameRegistry, SafetyAlert, TargetFilter};
use teleop_msg::{
    decode, encode, log_envelope, ControlFrame, Envelope, Heartbeat, HeartbeatAck,
    MessageDirection, ObjectPose, Payload, Pose, SimEventPayload, SimState, StateFrame,
    StateStats, UiCmd,
};
use teleop_rt::{
    command_channel, period_from_hz, state_channel, CommandReader, CommandWriter, Posted,
    RateLimiter, StatePublisher, StateReader,
};
use teleop_sim::{ActuatorId, BodyPose, PhysicsEngine, PhysicsError};
use thiserror::Error;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::command::ControlCommand;
use crate::session::{Rejected, SessionHandle, SessionMachine, SessionView};

/// Capacity of the per-connection message queues.
pub const OUTBOUND_QUEUE_DEPTH: usize = 64;

/// Unrecoverable failure reported by the transport for one connection.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("transport failure: {0}")]
    Failure(String),
}

/// Message-oriented transport seen by the orchestrator.
///
/// The inbound stream ending means the peer closed the connection.
#[derive(Debug)]
pub struct ConnectionIo {
    pub inbound: mpsc::Receiver<Result<String, TransportError>>,
    pub outbound: mpsc::Sender<String>,
}

impl ConnectionIo {
    /// Create bounded queues, returning the orchestrator side plus the
    /// transport's inbound sender and outbound receiver.
    pub fn channel() -> (
        Self,
        mpsc::Sender<Result<String, TransportError>>,
        mpsc::Receiver<String>,
    ) {
        let (inbound_tx, inbound_rx) = mpsc::channel(OUTBOUND_QUEUE_DEPTH);
        let (outbound_tx, outbound_rx) = mpsc::channel(OUTBOUND_QUEUE_DEPTH);
        (
            Self {
                inbound: inbound_rx,
                outbound: outbound_tx,
            },
            inbound_tx,
            outbound_rx,
        )
    }
}

/// Why a connection ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    TransportClosed,
    TransportFailure(String),
    OutboundClosed,
    Shutdown,
}

#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("physics engine fault: {0}")]
    Physics(#[from] PhysicsError),
    #[error("session task failed: {0}")]
    TaskJoin(String),
}

/// Outcome of a connection that ended without a physics fault.
#[derive(Debug)]
pub struct Finished<P> {
    /// The engine, handed back for the next connection.
    pub engine: P,
    pub reason: CloseReason,
}

#[derive(Debug, Clone)]
struct Shutdown {
    trigger: Arc<watch::Sender<bool>>,
    signal: watch::Receiver<bool>,
}

impl Shutdown {
    fn new() -> Self {
        let (trigger, signal) = watch::channel(false);
        Self {
            trigger: Arc::new(trigger),
            signal,
        }
    }

    fn trigger(&self) {
        self.trigger.send_replace(true);
    }

    async fn requested(&mut self) {
        let _ = self.signal.wait_for(|stop| *stop).await;
    }
}

/// Resolves when the server-wide stop flag is raised. Never resolves without one.
async fn external_stop(stop: &mut Option<watch::Receiver<bool>>) {
    if let Some(rx) = stop {
        let raised = rx.wait_for(|stop| *stop).await.is_ok();
        if raised {
            return;
        }
    }
    std::future::pending::<()>().await
}

#[derive(Debug)]
struct OutboxClosed;

/// Stamps, encodes and queues outbound envelopes. Shared by the receive and broadcast loops.
#[derive(Debug, Clone)]
struct Outbox {
    tx: mpsc::Sender<String>,
    seq: Arc<AtomicU64>,
}

impl Outbox {
    fn new(tx: mpsc::Sender<String>) -> Self {
        Self {
            tx,
            seq: Arc::new(AtomicU64::new(1)),
        }
    }

    fn render(&self, session_id: &str, payload: Payload) -> Option<String> {
        let envelope = Envelope::new(
            self.seq.fetch_add(1, Ordering::Relaxed),
            unix_millis(),
            session_id,
            payload,
        );
        log_envelope(MessageDirection::Outbound, &envelope);
        match encode(&envelope) {
            Ok(text) => Some(text),
            Err(err) => {
                error!(msg_type = %envelope.msg_type(), error = %err, "failed to encode outbound envelope");
                None
            }
        }
    }

    /// Queue a message, waiting for room. Used for events and acks.
    async fn send(&self, session_id: &str, payload: Payload) -> Result<(), OutboxClosed> {
        let Some(text) = self.render(session_id, payload) else {
            return Ok(());
        };
        self.tx.send(text).await.map_err(|_| OutboxClosed)
    }

    /// Queue a message only if there is room. Returns whether it was queued.
    fn try_send(&self, session_id: &str, payload: Payload) -> Result<bool, OutboxClosed> {
        let Some(text) = self.render(session_id, payload) else {
            return Ok(false);
        };
        match self.tx.try_send(text) {
            Ok(()) => Ok(true),
            Err(TrySendError::Full(_)) => Ok(false),
            Err(TrySendError::Closed(_)) => Err(OutboxClosed),
        }
    }
}

/// Owns one operator connection for its whole lifetime.
pub struct SessionOrchestrator<P> {
    scene: Arc<SceneConfig>,
    engine: P,
    metrics: Option<TeleopMetrics>,
    stop: Option<watch::Receiver<bool>>,
}

impl<P: PhysicsEngine + 'static> SessionOrchestrator<P> {
    pub fn new(scene: Arc<SceneConfig>, engine: P) -> Self {
        Self {
            scene,
            engine,
            metrics: None,
            stop: None,
        }
    }

    pub fn with_metrics(mut self, metrics: TeleopMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Close the connection when `stop` becomes `true`.
    pub fn with_stop(mut self, stop: watch::Receiver<bool>) -> Self {
        self.stop = Some(stop);
        self
    }

    /// Run the receive, control and broadcast loops until the connection ends.
    ///
    /// A physics fault is returned as an error; every other ending hands the
    /// engine back.
    pub async fn run(self, io: ConnectionIo) -> crate::Result<Finished<P>> {
        let SessionOrchestrator {
            scene,
            engine,
            metrics,
            stop,
        } = self;
        let shutdown = Shutdown::new();
        let machine = SessionMachine::new(scene.scene_id.clone());
        let session = machine.handle();
        let (command_writer, command_reader) = command_channel();
        let (state_publisher, state_reader) = state_channel();
        let outbox = Outbox::new(io.outbound);

        if let Some(metrics) = &metrics {
            metrics.connection_opened();
        }
        info!(scene_id = %scene.scene_id, "operator connection opened");

        let tick = ControlTick::new(
            scene.clone(),
            engine,
            command_reader,
            state_publisher,
            session.clone(),
        )
        .with_metrics(metrics.clone());
        let broadcaster = Broadcaster {
            states: state_reader,
            session: session.clone(),
            outbox: outbox.clone(),
            period: period_from_hz(scene.rates.state_hz),
            metrics: metrics.clone(),
        };
        let receiver = ReceiveLoop {
            machine,
            session,
            frames: FrameRegistry::from_config(&scene.frames),
            commands: command_writer,
            outbox,
            metrics: metrics.clone(),
            opened_at: Instant::now(),
        };

        let control = tokio::spawn(tick.run(shutdown.clone()));
        let broadcast = tokio::spawn(broadcaster.run(shutdown.clone()));
        let receive = tokio::spawn(receiver.run(io.inbound, shutdown.clone(), stop));

        let reason = receive.await;
        shutdown.trigger();
        let engine = control.await;
        let broadcast = broadcast.await;

        if let Some(metrics) = &metrics {
            metrics.connection_closed();
        }

        let reason = reason.map_err(|err| OrchestratorError::TaskJoin(err.to_string()))?;
        broadcast.map_err(|err| OrchestratorError::TaskJoin(err.to_string()))?;
        let engine = engine.map_err(|err| OrchestratorError::TaskJoin(err.to_string()))??;
        info!(reason = ?reason, "operator connection closed");
        Ok(Finished { engine, reason })
    }
}

struct ReceiveLoop {
    machine: SessionMachine,
    session: SessionHandle,
    frames: FrameRegistry,
    commands: CommandWriter<ControlCommand>,
    outbox: Outbox,
    metrics: Option<TeleopMetrics>,
    opened_at: Instant,
}

impl ReceiveLoop {
    async fn run(
        mut self,
        mut inbound: mpsc::Receiver<Result<String, TransportError>>,
        mut shutdown: Shutdown,
        mut stop: Option<watch::Receiver<bool>>,
    ) -> CloseReason {
        let reason = loop {
            tokio::select! {
                _ = shutdown.requested() => break CloseReason::Shutdown,
                _ = external_stop(&mut stop) => break CloseReason::Shutdown,
                message = inbound.recv() => match message {
                    None => break CloseReason::TransportClosed,
                    Some(Err(err)) => {
                        warn!(error = %err, "transport failed");
                        break CloseReason::TransportFailure(err.to_string());
                    }
                    Some(Ok(text)) => {
                        if self.handle_text(&text).await.is_err() {
                            break CloseReason::OutboundClosed;
                        }
                    }
                },
            }
        };

        if let Some(session_id) = self.machine.tear_down() {
            info!(session_id = %session_id, reason = ?reason, "session destroyed with its connection");
        }
        shutdown.trigger();
        reason
    }

    async fn handle_text(&mut self, text: &str) -> Result<(), OutboxClosed> {
        let envelope = match decode(text) {
            Ok(envelope) => envelope,
            Err(err) => {
                warn!(kind = err.kind(), error = %err, "dropping malformed envelope");
                if let Some(metrics) = &self.metrics {
                    metrics.record_protocol_error(err.kind());
                }
                return Ok(());
            }
        };
        log_envelope(MessageDirection::Inbound, &envelope);
        if let Some(metrics) = &self.metrics {
            metrics.record_envelope(envelope.msg_type().as_str());
        }

        let seq = envelope.seq();
        let t_send_ms = envelope.t_send_ms();
        match envelope.into_payload() {
            Payload::UiCmd(cmd) => self.handle_ui_cmd(cmd).await,
            Payload::ControlFrame(frame) => {
                self.handle_control_frame(seq, t_send_ms, frame);
                Ok(())
            }
            Payload::Heartbeat(heartbeat) => self.handle_heartbeat(heartbeat).await,
            other => {
                debug!(msg_type = %other.message_type(), seq, "ignoring server-bound message from operator");
                Ok(())
            }
        }
    }

    async fn handle_ui_cmd(&mut self, cmd: UiCmd) -> Result<(), OutboxClosed> {
        match self.machine.apply(&cmd) {
            Ok(transition) => {
                if transition.reset_requested {
                    self.commands.clear();
                }
                let payload = Payload::SimEvent(SimEventPayload {
                    event: transition.event,
                    sim_state: transition.state,
                    session_id: transition.session_id.clone(),
                });
                self.outbox.send(&transition.session_id, payload).await
            }
            Err(Rejected::NoSession) => {
                debug!(command = ?cmd.command, "ui command ignored without a session");
                Ok(())
            }
            Err(rejected) => {
                info!(command = ?cmd.command, reason = %rejected, "ui command rejected");
                Ok(())
            }
        }
    }

    fn handle_control_frame(&mut self, seq: u64, t_send_ms: u64, frame: ControlFrame) {
        let view = self.session.snapshot();
        let t_s = self.opened_at.elapsed().as_secs_f64();
        match ControlCommand::admit(&view, &self.frames, seq, t_send_ms, t_s, frame) {
            Ok(command) => {
                if self.commands.post(command) == Posted::Replaced {
                    if let Some(metrics) = &self.metrics {
                        metrics.record_coalesced();
                    }
                }
            }
            Err(reason) => {
                debug!(seq, reason = %reason, "control frame dropped at admission");
                if let Some(metrics) = &self.metrics {
                    metrics.record_admission_drop(reason.as_str());
                }
            }
        }
    }

    async fn handle_heartbeat(&mut self, heartbeat: Heartbeat) -> Result<(), OutboxClosed> {
        let rtt_ms_est = rtt_estimate_ms(unix_millis(), heartbeat.t_origin_ms);
        self.machine.record_heartbeat(rtt_ms_est);
        let session_id = self.machine.session_id().unwrap_or_default().to_owned();
        let ack = Payload::HeartbeatAck(HeartbeatAck {
            t_origin_ms: heartbeat.t_origin_ms,
            rtt_ms_est,
        });
        self.outbox.send(&session_id, ack).await?;
        if let Some(metrics) = &self.metrics {
            metrics.record_heartbeat_ack();
        }
        Ok(())
    }
}

struct Broadcaster {
    states: StateReader<StateFrame>,
    session: SessionHandle,
    outbox: Outbox,
    period: Duration,
    metrics: Option<TeleopMetrics>,
}

impl Broadcaster {
    async fn run(self, mut shutdown: Shutdown) {
        let mut limiter = RateLimiter::new(self.period);
        loop {
            tokio::select! {
                biased;
                _ = shutdown.requested() => break,
                _ = limiter.tick() => {
                    let Some(frame) = self.states.latest() else {
                        continue;
                    };
                    let session_id = self.session.snapshot().session_id.unwrap_or_default();
                    match self.outbox.try_send(&session_id, Payload::StateFrame(frame)) {
                        Ok(delivered) => {
                            if !delivered {
                                debug!("outbound queue full; state frame skipped");
                            }
                            if let Some(metrics) = &self.metrics {
                                metrics.record_state_frame(delivered);
                            }
                        }
                        Err(OutboxClosed) => {
                            debug!("outbound channel closed; stopping broadcast");
                            shutdown.trigger();
                            break;
                        }
                    }
                }
            }
        }
    }
}

/// The control tick: the only code that touches the physics engine.
///
/// Each [`step`](ControlTick::step) applies a pending RESET, drives the
/// actuators according to the session state, advances physics by one period
/// and publishes a fresh state frame.
pub struct ControlTick<P> {
    engine: P,
    scene: Arc<SceneConfig>,
    filter: TargetFilter,
    filter_state: FilterState,
    commands: CommandReader<ControlCommand>,
    states: StatePublisher<StateFrame>,
    session: SessionHandle,
    period: Duration,
    reset_epoch: u64,
    last_state: Option<SimState>,
    last_target: Option<Vector3<f64>>,
    alerts: Vec<SafetyAlert>,
    tick: u64,
    opened_at: Instant,
    last_jitter: Option<Duration>,
    stale_reported: bool,
    metrics: Option<TeleopMetrics>,
}

impl<P: PhysicsEngine> ControlTick<P> {
    pub fn new(
        scene: Arc<SceneConfig>,
        engine: P,
        commands: CommandReader<ControlCommand>,
        states: StatePublisher<StateFrame>,
        session: SessionHandle,
    ) -> Self {
        let reset_epoch = session.snapshot().reset_epoch;
        Self {
            filter: TargetFilter::from_config(&scene),
            period: period_from_hz(scene.rates.control_hz),
            engine,
            scene,
            filter_state: FilterState::new(),
            commands,
            states,
            session,
            reset_epoch,
            last_state: None,
            last_target: None,
            alerts: Vec::new(),
            tick: 0,
            opened_at: Instant::now(),
            last_jitter: None,
            stale_reported: false,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Option<TeleopMetrics>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn engine(&self) -> &P {
        &self.engine
    }

    pub fn into_engine(self) -> P {
        self.engine
    }

    /// Last safe target produced by the filter for the active command.
    pub fn last_target(&self) -> Option<Vector3<f64>> {
        self.last_target
    }

    pub fn filter_state(&self) -> &FilterState {
        &self.filter_state
    }

    /// Run one tick.
    pub fn step(&mut self) -> Result<StateFrame, PhysicsError> {
        let view = self.session.snapshot();
        if view.reset_epoch != self.reset_epoch {
            self.reset_epoch = view.reset_epoch;
            self.reset_scene()?;
        }

        let state = view.active_state();
        if state != self.last_state {
            self.commands_settle(state)?;
            self.last_state = state;
        }

        match state {
            Some(SimState::Running) => self.drive()?,
            Some(SimState::Paused) => {
                self.commands.clear();
                let velocities = self.engine.read_joint_state().velocities;
                let command = self.filter.pause_command(&velocities);
                self.write_joint_velocities(command.as_slice())?;
            }
            Some(SimState::Idle) | Some(SimState::Error) | None => {
                self.commands.clear();
                self.halt()?;
            }
        }

        self.engine.advance(self.period)?;
        self.tick += 1;
        let frame = self.snapshot(state.unwrap_or_default(), &view)?;
        self.states.publish(frame.clone());
        Ok(frame)
    }

    async fn run(mut self, mut shutdown: Shutdown) -> Result<P, PhysicsError> {
        let mut limiter = RateLimiter::new(self.period);
        let timing = LoopTimingReporter::new(self.period);
        loop {
            tokio::select! {
                biased;
                _ = shutdown.requested() => break,
                _ = limiter.tick() => {
                    self.last_jitter = timing.record_tick();
                    if let (Some(jitter), Some(metrics)) = (self.last_jitter, &self.metrics) {
                        metrics.observe_tick_jitter(jitter);
                    }
                    let started = Instant::now();
                    if let Err(err) = self.step() {
                        error!(tick = self.tick, error = %err, "physics engine fault");
                        shutdown.trigger();
                        return Err(err);
                    }
                    let elapsed = started.elapsed();
                    if elapsed > self.period {
                        warn!(
                            tick = self.tick,
                            elapsed_us = duration_to_micros(elapsed),
                            period_us = duration_to_micros(self.period),
                            "control tick overran its period"
                        );
                    }
                }
            }
        }

        if let Err(err) = self.halt() {
            warn!(error = %err, "failed to stop joints at connection close");
        }
        if let Some(summary) = timing.histogram().summary() {
            debug!(
                samples = summary.samples,
                mean_us = summary.mean_us,
                std_dev_us = summary.std_dev_us,
                max_us = summary.max_us,
                "control tick jitter summary"
            );
        }
        Ok(self.engine)
    }

    /// Entering a new state stops the arm and forgets the previous command.
    fn commands_settle(&mut self, state: Option<SimState>) -> Result<(), PhysicsError> {
        debug!(from = ?self.last_state, to = ?state, "control tick observed state change");
        self.last_target = None;
        self.alerts.clear();
        self.halt()
    }

    fn drive(&mut self) -> Result<(), PhysicsError> {
        let scene = Arc::clone(&self.scene);
        let target = match self.commands.take() {
            Some(command) => {
                match self.filter.constrain_target(
                    &mut self.filter_state,
                    command.target_world,
                    command.t_s,
                ) {
                    Ok(constrained) => {
                        for alert in &constrained.alerts {
                            debug!(seq = command.seq, alert = %alert, "safety alert");
                            if let Some(metrics) = &self.metrics {
                                metrics.record_safety_alert(alert.as_str());
                            }
                        }
                        self.alerts = constrained.alerts;
                        self.last_target = Some(constrained.target);
                        let gripper = ActuatorId::Named(scene.robot.gripper.actuator_name.clone());
                        self.engine.write_actuator_command(
                            &gripper,
                            command.frame.left_grip.actuator_value(),
                        )?;
                        constrained.target
                    }
                    Err(err) => {
                        warn!(seq = command.seq, error = %err, "control command rejected by the filter");
                        return self.halt();
                    }
                }
            }
            None => match (scene.control.idle_policy, self.last_target) {
                (IdlePolicy::TrackLastTarget, Some(target)) => target,
                _ => return self.halt(),
            },
        };

        let site = scene.robot.ee_site.as_str();
        let ee_pos = self.engine.read_site_pose(site)?;
        let jacobian = self.engine.compute_jacobian(site)?;
        match self.filter.track(target, ee_pos, &jacobian) {
            Ok(dq) => self.write_joint_velocities(dq.as_slice()),
            Err(err) => {
                warn!(error = %err, "differential IK failed; holding position");
                self.halt()
            }
        }
    }

    fn write_joint_velocities(&mut self, dq: &[f64]) -> Result<(), PhysicsError> {
        for (joint, value) in dq.iter().enumerate() {
            self.engine
                .write_actuator_command(&ActuatorId::Joint(joint), *value)?;
        }
        Ok(())
    }

    fn halt(&mut self) -> Result<(), PhysicsError> {
        let joints = self.engine.read_joint_state().positions.len();
        self.write_joint_velocities(&vec![0.0; joints])
    }

    fn reset_scene(&mut self) -> Result<(), PhysicsError> {
        self.engine.reset_to_home(&self.scene.robot.home_q)?;
        for object in &self.scene.objects {
            self.engine
                .place_body(&object.name, BodyPose::from_config(&object.pose))?;
        }
        self.filter_state.reset();
        self.last_target = None;
        self.alerts.clear();
        info!(reset_epoch = self.reset_epoch, "scene reset to home");
        Ok(())
    }

    fn snapshot(&mut self, state: SimState, view: &SessionView) -> Result<StateFrame, PhysicsError> {
        let joints = self.engine.read_joint_state();
        let ee = self.engine.read_site_pose(&self.scene.robot.ee_site)?;
        let objects = self
            .scene
            .objects
            .iter()
            .map(|object| {
                let pose = self.engine.read_body_pose(&object.name)?;
                Ok(ObjectPose {
                    name: object.name.clone(),
                    pose: Pose {
                        pos_m: pose.position_array(),
                        quat_xyzw: pose.quat_xyzw(),
                    },
                })
            })
            .collect::<Result<Vec<_>, PhysicsError>>()?;
        let stats = self.stats(view);
        Ok(StateFrame {
            sim_state: state,
            q_rad: joints.positions,
            qd_rad_s: joints.velocities,
            ee_pos_m: [ee.x, ee.y, ee.z],
            objects,
            alerts: self.alerts.iter().map(|a| a.as_str().to_owned()).collect(),
            stats,
        })
    }

    fn stats(&mut self, view: &SessionView) -> StateStats {
        let heartbeat_age = view
            .link
            .last_heartbeat_at
            .unwrap_or(self.opened_at)
            .elapsed();
        let stale = heartbeat_age > self.scene.heartbeat.timeout_ms;
        let age_ms = u64::try_from(heartbeat_age.as_millis()).unwrap_or(u64::MAX);
        if stale && !self.stale_reported && view.session_id.is_some() {
            warn!(age_ms, "operator heartbeat is stale");
        }
        self.stale_reported = stale;

        let mut stats = StateStats::new();
        stats.insert("tick".into(), json!(self.tick));
        stats.insert(
            "sim_time_s".into(),
            json!(self.engine.sim_time().as_secs_f64()),
        );
        if let Some(rtt) = view.link.rtt_ms_est {
            stats.insert("rtt_ms_est".into(), json!(rtt));
        }
        stats.insert("heartbeat_age_ms".into(), json!(age_ms));
        stats.insert("heartbeat_stale".into(), json!(stale));
        stats.insert(
            "tick_jitter_us".into(),
            json!(self.last_jitter.map(duration_to_micros).unwrap_or(0)),
        );
        stats
    }
}

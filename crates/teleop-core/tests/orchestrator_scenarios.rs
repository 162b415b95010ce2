//! ---
//! ems_section: "01-core-functionality"
//! ems_subsection: "tests"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "End-to-end session scenarios over in-memory connections."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use teleop_common::{unix_millis, SceneConfig};
use teleop_core::{CloseReason, ConnectionIo, OrchestratorError, SessionOrchestrator, TransportError};
use teleop_msg::{
    decode, encode, ControlFrame, Envelope, GripCommand, GripMode, Heartbeat, HeartbeatAck,
    Payload, SimEvent, SimEventPayload, SimState, StateFrame, UiCmd, UiCommand,
};
use teleop_sim::{
    ActuatorId, BodyPose, JointState, KinematicArm, PhysicsEngine, PhysicsError,
};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::timeout;

const SCENE: &str = r#"
scene_id = "bench"

[robot]
home_q = [0.0, 0.6, -1.2, 0.6]
link_lengths_m = [0.2, 0.3, 0.3, 0.15]

[[objects]]
name = "cube"
type = "box"
size_m = [0.05, 0.05, 0.05]
pose = { pos_m = [0.5, 0.0, 1.025], quat_xyzw = [0.0, 0.0, 0.0, 1.0] }

[control.filter]
type = "none"

[rates]
state_hz = 200
control_hz = 200
"#;

const HOME: [f64; 4] = [0.0, 0.6, -1.2, 0.6];
const WAIT: Duration = Duration::from_secs(5);

fn scene() -> Arc<SceneConfig> {
    Arc::new(SCENE.parse().expect("test scene"))
}

/// Scripted operator on the far side of an in-memory connection.
struct Operator {
    tx: mpsc::Sender<Result<String, TransportError>>,
    rx: mpsc::Receiver<String>,
    seq: u64,
    session_id: String,
}

impl Operator {
    async fn send(&mut self, payload: Payload) -> Result<()> {
        self.seq += 1;
        let envelope = Envelope::new(self.seq, unix_millis(), self.session_id.clone(), payload);
        self.send_text(encode(&envelope)?).await
    }

    async fn send_text(&mut self, text: impl Into<String>) -> Result<()> {
        self.tx
            .send(Ok(text.into()))
            .await
            .map_err(|_| anyhow!("server stopped reading"))
    }

    async fn recv(&mut self) -> Result<Envelope> {
        let text = timeout(WAIT, self.rx.recv())
            .await
            .context("timed out waiting for the server")?
            .ok_or_else(|| anyhow!("server closed the connection"))?;
        Ok(decode(&text)?)
    }

    async fn event(&mut self) -> Result<SimEventPayload> {
        loop {
            if let Payload::SimEvent(event) = self.recv().await?.into_payload() {
                return Ok(event);
            }
        }
    }

    async fn ack(&mut self) -> Result<HeartbeatAck> {
        loop {
            if let Payload::HeartbeatAck(ack) = self.recv().await?.into_payload() {
                return Ok(ack);
            }
        }
    }

    async fn state_where(&mut self, accept: impl Fn(&StateFrame) -> bool) -> Result<StateFrame> {
        loop {
            if let Payload::StateFrame(frame) = self.recv().await?.into_payload() {
                if accept(&frame) {
                    return Ok(frame);
                }
            }
        }
    }

    async fn ui(&mut self, command: UiCommand) -> Result<SimEventPayload> {
        self.send(Payload::UiCmd(UiCmd {
            command,
            requested_scene_config_id: "bench".into(),
        }))
        .await?;
        let event = self.event().await?;
        self.session_id = event.session_id.clone();
        Ok(event)
    }

    async fn target(&mut self, pos: [f64; 3], clutch: bool) -> Result<()> {
        self.send(Payload::ControlFrame(ControlFrame {
            frame_id: "world".into(),
            left_target_pos_m: pos,
            left_grip: GripCommand {
                mode: GripMode::Binary,
                value: 1.0,
            },
            clutch_enabled: clutch,
            alerts: vec![],
        }))
        .await
    }
}

type Served<P> = JoinHandle<Result<teleop_core::Finished<P>, OrchestratorError>>;

fn serve<P: PhysicsEngine + 'static>(
    engine: P,
    configure: impl FnOnce(SessionOrchestrator<P>) -> SessionOrchestrator<P>,
) -> (Operator, Served<P>) {
    let (io, tx, rx) = ConnectionIo::channel();
    let orchestrator = configure(SessionOrchestrator::new(scene(), engine));
    let served = tokio::spawn(orchestrator.run(io));
    let operator = Operator {
        tx,
        rx,
        seq: 0,
        session_id: String::new(),
    };
    (operator, served)
}

fn arm() -> KinematicArm {
    KinematicArm::from_config(&scene())
}

fn distance(a: [f64; 3], b: [f64; 3]) -> f64 {
    a.iter()
        .zip(b)
        .map(|(x, y)| (x - y).powi(2))
        .sum::<f64>()
        .sqrt()
}

#[tokio::test]
async fn out_of_bounds_target_is_clamped_and_tracked() -> Result<()> {
    let (mut op, _served) = serve(arm(), |o| o);
    let event = op.ui(UiCommand::Connect).await?;
    assert_eq!(event.event, SimEvent::Connected);
    assert_eq!(event.sim_state, SimState::Idle);
    assert!(!event.session_id.is_empty());

    let start = op.state_where(|f| f.sim_state == SimState::Idle).await?;
    let event = op.ui(UiCommand::Start).await?;
    assert_eq!((event.event, event.sim_state), (SimEvent::Started, SimState::Running));

    let clamped = [0.8, 0.0, 1.2];
    for _ in 0..40 {
        op.target([2.0, 0.0, 1.2], true).await?;
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    let frame = op
        .state_where(|f| f.alerts.iter().any(|a| a == "WORKSPACE_LIMIT"))
        .await?;
    assert_eq!(frame.sim_state, SimState::Running);
    assert!(distance(frame.ee_pos_m, clamped) < distance(start.ee_pos_m, clamped));
    Ok(())
}

fn inside_workspace(p: [f64; 3]) -> bool {
    let (min, max) = ([0.2, -0.4, 1.0], [0.8, 0.4, 1.5]);
    (0..3).all(|axis| p[axis] >= min[axis] - 1e-3 && p[axis] <= max[axis] + 1e-3)
}

#[tokio::test]
async fn clamped_target_is_approached_but_never_passed() -> Result<()> {
    let (mut op, _served) = serve(arm(), |o| o);
    op.ui(UiCommand::Connect).await?;
    op.ui(UiCommand::Start).await?;
    let start = op.state_where(|f| f.sim_state == SimState::Running).await?;

    // Above the workspace ceiling; clamped down to z = 1.5.
    let clamped = [0.5, 0.2, 1.5];
    let bound = distance(start.ee_pos_m, clamped);
    op.target([0.5, 0.2, 1.9], true).await?;
    op.state_where(|f| f.alerts.iter().any(|a| a == "WORKSPACE_LIMIT"))
        .await?;

    let mut last = bound;
    for _ in 0..300 {
        let frame = op.state_where(|_| true).await?;
        last = distance(frame.ee_pos_m, clamped);
        assert!(last <= bound + 1e-3, "ee moved away: {last} > {bound}");
        assert!(inside_workspace(frame.ee_pos_m), "ee left the workspace: {:?}", frame.ee_pos_m);
    }
    assert!(last < bound / 2.0, "ee stalled {last} m from the clamped target");
    Ok(())
}

#[tokio::test]
async fn heartbeats_are_acknowledged_with_a_non_negative_rtt() -> Result<()> {
    let (mut op, _served) = serve(arm(), |o| o);
    op.ui(UiCommand::Connect).await?;

    let origin = unix_millis();
    op.send(Payload::Heartbeat(Heartbeat { t_origin_ms: origin })).await?;
    let ack = op.ack().await?;
    assert_eq!(ack.t_origin_ms, origin);
    assert!(ack.rtt_ms_est >= 0.0);

    // A client clock running ahead must not yield a negative estimate.
    op.send(Payload::Heartbeat(Heartbeat {
        t_origin_ms: origin + 60_000,
    }))
    .await?;
    assert_eq!(op.ack().await?.rtt_ms_est, 0.0);

    let frame = op.state_where(|f| f.stats.contains_key("rtt_ms_est")).await?;
    assert_eq!(frame.stats["heartbeat_stale"], serde_json::json!(false));
    Ok(())
}

#[tokio::test]
async fn pause_holds_the_arm() -> Result<()> {
    let (mut op, _served) = serve(arm(), |o| o);
    op.ui(UiCommand::Connect).await?;
    op.ui(UiCommand::Start).await?;
    for _ in 0..20 {
        op.target([0.6, 0.2, 1.3], true).await?;
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    let event = op.ui(UiCommand::Pause).await?;
    assert_eq!(event.sim_state, SimState::Paused);

    // Frames sent while paused are dropped at admission.
    op.target([0.3, -0.3, 1.1], true).await?;
    let first = op.state_where(|f| f.sim_state == SimState::Paused).await?;
    tokio::time::sleep(Duration::from_millis(50)).await;
    let later = op
        .state_where(|f| f.sim_state == SimState::Paused && f.stats["tick"] != first.stats["tick"])
        .await?;
    assert_eq!(first.q_rad, later.q_rad);
    assert!(later.qd_rad_s.iter().all(|v| *v == 0.0));
    Ok(())
}

#[tokio::test]
async fn released_clutch_and_idle_sessions_never_move_the_arm() -> Result<()> {
    let (mut op, _served) = serve(arm(), |o| o);

    // Before CONNECT nothing is admitted.
    op.target([0.6, 0.2, 1.3], true).await?;
    op.ui(UiCommand::Connect).await?;
    op.target([0.6, 0.2, 1.3], true).await?;
    op.ui(UiCommand::Start).await?;
    for _ in 0..20 {
        op.target([0.6, 0.2, 1.3], false).await?;
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    let frame = op.state_where(|f| f.sim_state == SimState::Running).await?;
    assert_eq!(frame.q_rad, HOME.to_vec());
    Ok(())
}

#[tokio::test]
async fn reset_restores_home_pose_and_objects() -> Result<()> {
    let (mut op, _served) = serve(arm(), |o| o);
    op.ui(UiCommand::Connect).await?;
    op.ui(UiCommand::Start).await?;
    for _ in 0..20 {
        op.target([0.6, 0.3, 1.4], true).await?;
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    op.state_where(|f| f.sim_state == SimState::Running && f.q_rad != HOME.to_vec())
        .await?;

    let event = op.ui(UiCommand::Reset).await?;
    assert_eq!((event.event, event.sim_state), (SimEvent::ResetDone, SimState::Idle));
    let frame = op.state_where(|f| f.sim_state == SimState::Idle).await?;
    assert_eq!(frame.q_rad, HOME.to_vec());
    assert_eq!(frame.objects[0].name, "cube");
    assert_eq!(frame.objects[0].pose.pos_m, [0.5, 0.0, 1.025]);
    assert!(frame.alerts.is_empty());
    Ok(())
}

#[tokio::test]
async fn invalid_commands_and_garbage_do_not_close_the_connection() -> Result<()> {
    let (mut op, _served) = serve(arm(), |o| o);
    op.send_text("not json").await?;
    op.send_text(r#"{"schema_version":"0.9","msg_type":"heartbeat"}"#).await?;
    op.ui(UiCommand::Connect).await?;
    // PAUSE from IDLE is refused without an event.
    op.send(Payload::UiCmd(UiCmd {
        command: UiCommand::Pause,
        requested_scene_config_id: String::new(),
    }))
    .await?;
    op.send(Payload::Heartbeat(Heartbeat {
        t_origin_ms: unix_millis(),
    }))
    .await?;

    loop {
        match op.recv().await?.into_payload() {
            Payload::SimEvent(event) => bail!("unexpected event {event:?}"),
            Payload::HeartbeatAck(_) => break,
            _ => {}
        }
    }
    Ok(())
}

#[tokio::test]
async fn closing_the_transport_returns_the_engine() -> Result<()> {
    let (mut op, served) = serve(arm(), |o| o);
    op.ui(UiCommand::Connect).await?;
    // Keep reading side open so only the inbound stream ends.
    let Operator { tx, rx: _rx, .. } = op;
    drop(tx);

    let finished = timeout(WAIT, served).await??.map_err(|e| anyhow!(e))?;
    assert_eq!(finished.reason, CloseReason::TransportClosed);
    assert_eq!(finished.engine.read_joint_state().positions, HOME.to_vec());
    Ok(())
}

#[tokio::test]
async fn transport_failure_is_reported() -> Result<()> {
    let (op, served) = serve(arm(), |o| o);
    op.tx
        .send(Err(TransportError::Failure("reset by peer".into())))
        .await
        .map_err(|_| anyhow!("server gone"))?;

    let finished = timeout(WAIT, served).await??.map_err(|e| anyhow!(e))?;
    assert_eq!(
        finished.reason,
        CloseReason::TransportFailure("transport failure: reset by peer".into())
    );
    Ok(())
}

#[tokio::test]
async fn stop_signal_ends_the_connection() -> Result<()> {
    let (stop_tx, stop_rx) = watch::channel(false);
    let (_op, served) = serve(arm(), |o| o.with_stop(stop_rx));
    tokio::time::sleep(Duration::from_millis(20)).await;
    stop_tx.send_replace(true);

    let finished = timeout(WAIT, served).await??.map_err(|e| anyhow!(e))?;
    assert_eq!(finished.reason, CloseReason::Shutdown);
    Ok(())
}

/// Arm whose integrator diverges after a few ticks.
struct DivergingArm {
    inner: KinematicArm,
    ticks_left: u32,
}

impl PhysicsEngine for DivergingArm {
    fn advance(&mut self, dt: Duration) -> teleop_sim::Result<()> {
        if self.ticks_left == 0 {
            return Err(PhysicsError::Fault("integrator diverged".into()));
        }
        self.ticks_left -= 1;
        self.inner.advance(dt)
    }

    fn read_joint_state(&self) -> JointState {
        self.inner.read_joint_state()
    }

    fn read_site_pose(&self, site: &str) -> teleop_sim::Result<nalgebra::Vector3<f64>> {
        self.inner.read_site_pose(site)
    }

    fn read_body_pose(&self, body: &str) -> teleop_sim::Result<BodyPose> {
        self.inner.read_body_pose(body)
    }

    fn compute_jacobian(&self, site: &str) -> teleop_sim::Result<nalgebra::DMatrix<f64>> {
        self.inner.compute_jacobian(site)
    }

    fn write_actuator_command(&mut self, actuator: &ActuatorId, value: f64) -> teleop_sim::Result<()> {
        self.inner.write_actuator_command(actuator, value)
    }

    fn reset_to_home(&mut self, joint_targets: &[f64]) -> teleop_sim::Result<()> {
        self.inner.reset_to_home(joint_targets)
    }

    fn place_body(&mut self, body: &str, pose: BodyPose) -> teleop_sim::Result<()> {
        self.inner.place_body(body, pose)
    }

    fn sim_time(&self) -> Duration {
        self.inner.sim_time()
    }
}

#[tokio::test]
async fn physics_fault_tears_the_connection_down() -> Result<()> {
    let engine = DivergingArm {
        inner: arm(),
        ticks_left: 5,
    };
    let (_op, served) = serve(engine, |o| o);
    match timeout(WAIT, served).await?? {
        Err(OrchestratorError::Physics(PhysicsError::Fault(reason))) => {
            assert_eq!(reason, "integrator diverged");
        }
        other => bail!("expected a physics fault, got {:?}", other.map(|f| f.reason)),
    }
    Ok(())
}

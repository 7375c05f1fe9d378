//! [`Gateway`] – turns request frames into control-plane calls.
//!
//! The socket handling lives in [`server`](crate::server); everything here is
//! plain async code over a [`Session`], so it can be driven without a network.

use std::sync::Arc;

use fleetlock_middleware::{EventBus, Topic};
use fleetlock_runtime::{ActionRequest, ControlPlane, Courier};
use fleetlock_types::{
    Actor, AssignmentTarget, DeviceAction, DeviceId, FleetError, FleetResult,
};
use futures_util::StreamExt;
use futures_util::stream::{BoxStream, select_all};
use serde::Serialize;
use serde_json::{Value, json};
use tokio::sync::mpsc::Sender;
use tokio::task::JoinHandle;
use tracing::{debug, info};
use uuid::Uuid;

use crate::protocol::{Request, RequestFrame, ServerFrame, outcome_body};
use crate::sessions::{ConnectionId, SessionRegistry};

// ─────────────────────────────────────────────────────────────────────────────
// Session
// ─────────────────────────────────────────────────────────────────────────────

/// Frames a connection may have queued for its socket.  A full queue makes
/// the event forwarder wait, so a slow reader lags on the bus instead of
/// growing this queue.
pub const OUTBOUND_CAPACITY: usize = 64;

/// Per-connection state.
pub struct Session {
    conn: ConnectionId,
    device: Option<DeviceId>,
    outbound: Sender<ServerFrame>,
    subscription: Option<JoinHandle<()>>,
}

impl Session {
    /// `outbound` receives pushed frames (commands and events); replies are
    /// returned by [`Gateway::handle_text`] instead.
    pub fn new(outbound: Sender<ServerFrame>) -> Self {
        Self {
            conn: Uuid::new_v4(),
            device: None,
            outbound,
            subscription: None,
        }
    }

    pub fn conn(&self) -> ConnectionId {
        self.conn
    }

    /// Device this connection speaks for, once it registered or said hello.
    pub fn device(&self) -> Option<DeviceId> {
        self.device
    }

    fn stop_subscription(&mut self) {
        if let Some(task) = self.subscription.take() {
            task.abort();
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.stop_subscription();
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Gateway
// ─────────────────────────────────────────────────────────────────────────────

pub struct Gateway {
    plane: Arc<ControlPlane>,
    sessions: Arc<SessionRegistry>,
    courier: Courier,
}

impl Gateway {
    pub fn new(plane: Arc<ControlPlane>) -> Self {
        let sessions = Arc::new(SessionRegistry::new());
        let courier = Courier::new(Arc::clone(&plane), sessions.clone());
        Self {
            plane,
            sessions,
            courier,
        }
    }

    pub fn plane(&self) -> &Arc<ControlPlane> {
        &self.plane
    }

    pub fn sessions(&self) -> &SessionRegistry {
        &self.sessions
    }

    /// Release everything the session registered.  Called when its socket
    /// closes.
    pub fn disconnect(&self, session: &mut Session) {
        session.stop_subscription();
        if let Some(device_id) = session.device.take() {
            if self.sessions.unbind(&device_id, session.conn) {
                debug!(%device_id, conn = %session.conn, "agent session closed");
            }
        }
    }

    /// Handle one text frame and produce its reply.
    pub async fn handle_text(&self, session: &mut Session, text: &str) -> ServerFrame {
        let frame: RequestFrame = match serde_json::from_str(text) {
            Ok(frame) => frame,
            Err(e) => return ServerFrame::malformed(e.to_string()),
        };
        let id = frame.id.clone();
        match self.handle(session, frame).await {
            Ok(body) => ServerFrame::ok(id, body),
            Err(err) => {
                debug!(conn = %session.conn, error = %err, "request rejected");
                ServerFrame::error(id, err)
            }
        }
    }

    fn bind(&self, session: &mut Session, device_id: DeviceId) {
        if session.device != Some(device_id) {
            if let Some(previous) = session.device.replace(device_id) {
                self.sessions.unbind(&previous, session.conn);
            }
        }
        self.sessions
            .bind(device_id, session.conn, session.outbound.clone());
    }

    /// The device the session is bound to, else the frame's explicit actor.
    ///
    /// A bound session always speaks for its device: naming any other actor
    /// is refused.
    fn actor(session: &Session, explicit: Option<Actor>) -> FleetResult<Actor> {
        match (session.device, explicit) {
            (Some(bound), None) => Ok(Actor::Device { device_id: bound }),
            (Some(bound), Some(Actor::Device { device_id })) if device_id == bound => {
                Ok(Actor::Device { device_id })
            }
            (Some(bound), Some(other)) => Err(FleetError::InvalidRequest(format!(
                "session is bound to device {bound} and cannot act as {other}"
            ))),
            (None, Some(actor)) => Ok(actor),
            (None, None) => Err(FleetError::InvalidRequest(
                "no actor given and session is not bound to a device".into(),
            )),
        }
    }

    async fn handle(&self, session: &mut Session, frame: RequestFrame) -> FleetResult<Value> {
        let RequestFrame { actor, request, .. } = frame;
        let plane = &self.plane;

        match request {
            // ── Agent ────────────────────────────────────────────────────────
            Request::Register { identity, profile } => {
                let device = plane.register_device(&identity, profile)?;
                self.bind(session, device.id);
                info!(device_id = %device.id, hostname = %device.hostname, "agent registered");
                encode(&device)
            }
            Request::Hello { device_id } => {
                let view = plane.device(&device_id)?;
                if !view.device.is_active {
                    return Err(FleetError::DeviceInactive(device_id));
                }
                self.bind(session, device_id);
                let redelivered = self.courier.redeliver(&device_id).await?;
                info!(%device_id, redelivered = redelivered.len(), "agent connected");
                Ok(json!({ "device": encode(&view)?, "redelivered": redelivered.len() }))
            }
            Request::Heartbeat(heartbeat) => {
                if let Some(bound) = session.device {
                    if bound != heartbeat.device_id {
                        return Err(FleetError::InvalidRequest(format!(
                            "session is bound to {bound}, heartbeat names {}",
                            heartbeat.device_id
                        )));
                    }
                }
                let ack = plane.heartbeat(&heartbeat)?;
                self.bind(session, heartbeat.device_id);
                encode(&ack)
            }
            Request::Ack { action_id } => {
                let actor = Self::actor(session, actor)?;
                encode(&plane.acknowledge(&actor, &action_id)?)
            }
            Request::Complete { action_id, result } => {
                let actor = Self::actor(session, actor)?;
                encode(&plane.complete(&actor, &action_id, result)?)
            }
            Request::Fail { action_id, error } => {
                let actor = Self::actor(session, actor)?;
                encode(&plane.fail(&actor, &action_id, &error)?)
            }
            Request::UnlockAttempt { action_id, success } => {
                let actor = Self::actor(session, actor)?;
                let attempt = plane.unlock_attempt(&actor, &action_id, success)?;
                Ok(json!({
                    "action": encode(&attempt.action)?,
                    "outcome": outcome_body(&attempt.outcome),
                }))
            }

            Request::LockScreenAttempt { device_id, success } => {
                let actor = Self::actor(session, actor)?;
                let device_id = device_id.or(session.device).ok_or_else(|| {
                    FleetError::InvalidRequest("no device_id given and session is not bound".into())
                })?;
                let outcome = plane.report_unlock_attempt(&actor, &device_id, success)?;
                Ok(json!({ "device_id": device_id, "outcome": outcome_body(&outcome) }))
            }

            // ── Actions ──────────────────────────────────────────────────────
            Request::Action {
                device_id,
                action_type,
                reason,
                force,
                details,
            } => {
                let actor = Self::actor(session, actor)?;
                let mut request = match details {
                    Some(details) if details.action_type() != action_type => {
                        return Err(FleetError::InvalidRequest(format!(
                            "details describe a {} action, not {action_type}",
                            details.action_type()
                        )));
                    }
                    Some(details) => ActionRequest::with_details(device_id, details),
                    None => ActionRequest::new(device_id, action_type),
                };
                if let Some(reason) = reason {
                    request = request.reason(reason);
                }
                if force {
                    request = request.forced();
                }
                encode(&self.courier.submit(&actor, request).await?)
            }
            Request::GetAction { action_id } => encode(&plane.action(&action_id)?),
            Request::Actions {
                device_id,
                status,
                action_type,
            } => {
                let actions: Vec<DeviceAction> = match (device_id, status, action_type) {
                    (Some(device_id), ..) => plane.actions_for_device(&device_id)?,
                    (None, Some(status), _) => plane.actions_by_status(status)?,
                    (None, None, Some(action_type)) => plane.actions_by_type(action_type)?,
                    (None, None, None) => plane.dispatcher().list_all()?,
                };
                let filtered: Vec<DeviceAction> = actions
                    .into_iter()
                    .filter(|a| status.is_none_or(|s| a.status == s))
                    .filter(|a| action_type.is_none_or(|t| a.action_type == t))
                    .collect();
                encode(&filtered)
            }

            // ── Devices ──────────────────────────────────────────────────────
            Request::Device { device_id } => encode(&plane.device(&device_id)?),
            Request::Devices { include_inactive } => encode(&plane.list_devices(include_inactive)),
            Request::Deactivate { device_id } => {
                let actor = Self::actor(session, actor)?;
                encode(&plane.deactivate_device(&actor, &device_id)?)
            }
            Request::Stats => Ok(json!({
                "fleet": encode(&plane.stats())?,
                "connected_agents": self.sessions.connected(),
            })),

            // ── Groups ───────────────────────────────────────────────────────
            Request::Groups => encode(&plane.list_groups()),
            Request::CreateGroup { name, description } => {
                let actor = Self::actor(session, actor)?;
                encode(&plane.create_group(&actor, &name, &description)?)
            }
            Request::RenameGroup {
                group_id,
                name,
                description,
            } => {
                let actor = Self::actor(session, actor)?;
                encode(&plane.rename_group(&actor, &group_id, &name, description.as_deref())?)
            }
            Request::DeleteGroup { group_id } => {
                let actor = Self::actor(session, actor)?;
                encode(&plane.delete_group(&actor, &group_id)?)
            }
            Request::AddMember {
                group_id,
                device_id,
            } => {
                let actor = Self::actor(session, actor)?;
                let added = plane.add_to_group(&actor, &group_id, &device_id)?;
                Ok(json!({ "changed": added }))
            }
            Request::RemoveMember {
                group_id,
                device_id,
            } => {
                let actor = Self::actor(session, actor)?;
                let removed = plane.remove_from_group(&actor, &group_id, &device_id)?;
                Ok(json!({ "changed": removed }))
            }

            // ── Policies ─────────────────────────────────────────────────────
            Request::Policies => {
                let actor = Self::actor(session, actor)?;
                encode(&plane.list_policies(&actor)?)
            }
            Request::GetPolicy { policy_id } => {
                let actor = Self::actor(session, actor)?;
                encode(&plane.get_policy(&actor, &policy_id)?)
            }
            Request::CreatePolicy { policy } => {
                let actor = Self::actor(session, actor)?;
                encode(&plane.create_policy(&actor, policy)?)
            }
            Request::CreatePolicyFromTemplate { name, template } => {
                let actor = Self::actor(session, actor)?;
                encode(&plane.create_policy_from_template(&actor, &name, template)?)
            }
            Request::UpdatePolicy { policy_id, policy } => {
                let actor = Self::actor(session, actor)?;
                encode(&plane.update_policy(&actor, &policy_id, policy)?)
            }
            Request::DeletePolicy { policy_id } => {
                let actor = Self::actor(session, actor)?;
                encode(&plane.delete_policy(&actor, &policy_id)?)
            }
            Request::Assign {
                policy_id,
                device_id,
                group_id,
            } => {
                let actor = Self::actor(session, actor)?;
                let target = AssignmentTarget::from_parts(device_id, group_id)?;
                encode(&plane.assign_policy(&actor, &policy_id, target)?)
            }
            Request::SetAssignmentActive {
                assignment_id,
                active,
            } => {
                let actor = Self::actor(session, actor)?;
                encode(&plane.set_assignment_active(&actor, &assignment_id, active)?)
            }
            Request::DeleteAssignment { assignment_id } => {
                let actor = Self::actor(session, actor)?;
                encode(&plane.delete_assignment(&actor, &assignment_id)?)
            }
            Request::Resolve { device_id } => {
                let actor = Self::actor(session, actor)?;
                encode(&plane.resolve_policy(&actor, &device_id)?)
            }

            // ── Streaming ────────────────────────────────────────────────────
            Request::Subscribe { topics } => {
                let topics = parse_topics(&topics)?;
                let stream = event_stream(plane.bus(), &topics);
                let outbound = session.outbound.clone();
                session.stop_subscription();
                session.subscription = Some(tokio::spawn(async move {
                    let mut stream = stream;
                    while let Some(event) = stream.next().await {
                        if outbound.send(ServerFrame::Event { event }).await.is_err() {
                            break;
                        }
                    }
                }));
                let names: Vec<&str> = topics.iter().map(Topic::as_str).collect();
                debug!(conn = %session.conn, topics = ?names, "subscribed");
                Ok(json!({ "topics": names }))
            }
        }
    }
}

fn encode<T: Serialize>(value: &T) -> FleetResult<Value> {
    serde_json::to_value(value).map_err(|e| FleetError::Transport(format!("encode error: {e}")))
}

/// An empty list means every topic.
fn parse_topics(names: &[String]) -> FleetResult<Vec<Topic>> {
    if names.is_empty() {
        return Ok(Topic::ALL.to_vec());
    }
    let mut topics = Vec::with_capacity(names.len());
    for name in names {
        let topic = Topic::parse(name)
            .ok_or_else(|| FleetError::InvalidRequest(format!("unknown topic: {name}")))?;
        if !topics.contains(&topic) {
            topics.push(topic);
        }
    }
    Ok(topics)
}

fn event_stream(bus: &EventBus, topics: &[Topic]) -> BoxStream<'static, fleetlock_types::Event> {
    if topics.len() == Topic::ALL.len() {
        return bus.subscribe_all().into_stream();
    }
    select_all(topics.iter().map(|t| bus.subscribe_to(*t).into_stream())).boxed()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use chrono::{TimeZone, Utc};
    use fleetlock_runtime::DispatchConfig;
    use fleetlock_store::ActionLedger;
    use fleetlock_types::ManualClock;
    use tokio::sync::mpsc::{self, Receiver};

    const ADMIN: &str = r#"{"kind":"user","id":"ops","role":"it_admin"}"#;
    const AUDITOR: &str = r#"{"kind":"user","id":"audit","role":"auditor"}"#;
    const SUPERADMIN: &str = r#"{"kind":"user","id":"root","role":"superadmin"}"#;

    fn gateway() -> Gateway {
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2025, 3, 3, 9, 0, 0).unwrap(),
        ));
        let plane = ControlPlane::new(
            ActionLedger::open_in_memory().unwrap(),
            DispatchConfig::default(),
            EventBus::default(),
            clock,
        );
        Gateway::new(Arc::new(plane))
    }

    fn session() -> (Session, Receiver<ServerFrame>) {
        let (tx, rx) = mpsc::channel(OUTBOUND_CAPACITY);
        (Session::new(tx), rx)
    }

    fn body(frame: ServerFrame) -> Value {
        match frame {
            ServerFrame::Reply {
                status: 200,
                body: Some(body),
                ..
            } => body,
            other => panic!("expected a 200 reply, got {other:?}"),
        }
    }

    /// Register a device over a fresh session and send its first heartbeat.
    async fn enrol(
        gw: &Gateway,
        hostname: &str,
    ) -> (Session, Receiver<ServerFrame>, String) {
        let (mut agent, rx) = session();
        let register = format!(r#"{{"op":"register","identity":{{"hostname":"{hostname}"}}}}"#);
        let device = body(gw.handle_text(&mut agent, &register).await);
        let device_id = device["id"].as_str().unwrap().to_string();
        let heartbeat = format!(r#"{{"op":"heartbeat","device_id":"{device_id}"}}"#);
        body(gw.handle_text(&mut agent, &heartbeat).await);
        (agent, rx, device_id)
    }

    fn lock_request(actor: &str, device_id: &str) -> String {
        format!(
            r#"{{"id":1,"op":"action","actor":{actor},"device_id":"{device_id}","action_type":"lock","reason":"left unattended"}}"#
        )
    }

    #[tokio::test]
    async fn register_binds_the_session() {
        let gw = gateway();
        let (mut agent, _rx, device_id) = enrol(&gw, "kiosk-3").await;
        assert_eq!(agent.device().map(|d| d.to_string()), Some(device_id.clone()));
        assert_eq!(gw.sessions().connected(), 1);

        let heartbeat = format!(r#"{{"op":"heartbeat","device_id":"{device_id}","is_locked":true}}"#);
        let ack = body(gw.handle_text(&mut agent, &heartbeat).await);
        assert_eq!(ack["applied"], true);
        assert_eq!(ack["status"], "locked");
        assert_eq!(ack["commands"], serde_json::json!([]));

        gw.disconnect(&mut agent);
        assert_eq!(gw.sessions().connected(), 0);
    }

    #[tokio::test]
    async fn heartbeat_for_another_device_is_rejected() {
        let gw = gateway();
        let (mut agent, _rx, _) = enrol(&gw, "kiosk-3").await;
        let (_other, _orx, other_id) = enrol(&gw, "kiosk-4").await;
        let heartbeat = format!(r#"{{"op":"heartbeat","device_id":"{other_id}"}}"#);
        assert_eq!(gw.handle_text(&mut agent, &heartbeat).await.status(), Some(422));
    }

    #[tokio::test]
    async fn operator_commands_are_pushed_to_the_agent() {
        let gw = gateway();
        let (mut agent, mut pushed, device_id) = enrol(&gw, "kiosk-3").await;
        let (mut operator, _orx) = session();

        let action = body(gw.handle_text(&mut operator, &lock_request(ADMIN, &device_id)).await);
        assert_eq!(action["status"], "sent");
        assert_eq!(action["initiator"], "ops");

        let Some(ServerFrame::Command { action: command }) = pushed.recv().await else {
            panic!("expected a pushed command");
        };
        assert_eq!(serde_json::to_value(command.id).unwrap(), action["id"]);

        let action_id = action["id"].as_str().unwrap();
        let ack = format!(r#"{{"op":"ack","action_id":"{action_id}"}}"#);
        assert_eq!(body(gw.handle_text(&mut agent, &ack).await)["status"], "acknowledged");
        let done = format!(r#"{{"op":"complete","action_id":"{action_id}","result":{{"ok":true}}}}"#);
        let completed = body(gw.handle_text(&mut agent, &done).await);
        assert_eq!(completed["status"], "completed");
        assert_eq!(completed["result"]["ok"], true);
    }

    #[tokio::test]
    async fn only_the_target_device_reports_outcomes() {
        let gw = gateway();
        let (_agent, _rx, device_id) = enrol(&gw, "kiosk-3").await;
        let (mut intruder, _irx, _) = enrol(&gw, "kiosk-4").await;
        let (mut operator, _orx) = session();

        let action = body(gw.handle_text(&mut operator, &lock_request(ADMIN, &device_id)).await);
        let ack = format!(r#"{{"op":"ack","action_id":"{}"}}"#, action["id"].as_str().unwrap());
        assert_eq!(gw.handle_text(&mut intruder, &ack).await.status(), Some(403));
    }

    #[tokio::test]
    async fn failures_map_to_status_codes() {
        let gw = gateway();
        let (_agent, _rx, device_id) = enrol(&gw, "kiosk-3").await;
        let (mut operator, _orx) = session();

        assert_eq!(gw.handle_text(&mut operator, "not json").await.status(), Some(422));

        let anonymous = format!(
            r#"{{"op":"action","device_id":"{device_id}","action_type":"lock"}}"#
        );
        assert_eq!(gw.handle_text(&mut operator, &anonymous).await.status(), Some(422));

        let unknown = lock_request(ADMIN, &DeviceId::new().to_string());
        assert_eq!(gw.handle_text(&mut operator, &unknown).await.status(), Some(404));

        let denied = lock_request(AUDITOR, &device_id);
        assert_eq!(gw.handle_text(&mut operator, &denied).await.status(), Some(403));

        let first = gw.handle_text(&mut operator, &lock_request(ADMIN, &device_id)).await;
        assert_eq!(first.status(), Some(200));
        let second = gw.handle_text(&mut operator, &lock_request(ADMIN, &device_id)).await;
        assert_eq!(second.status(), Some(409));

        let both = format!(
            r#"{{"op":"assign","actor":{SUPERADMIN},"policy_id":"{}","device_id":"{device_id}","group_id":"{}"}}"#,
            fleetlock_types::PolicyId::new(),
            fleetlock_types::GroupId::new()
        );
        assert_eq!(gw.handle_text(&mut operator, &both).await.status(), Some(422));
    }

    #[tokio::test]
    async fn mismatched_details_are_rejected() {
        let gw = gateway();
        let (_agent, _rx, device_id) = enrol(&gw, "kiosk-3").await;
        let (mut operator, _orx) = session();
        let request = format!(
            r#"{{"op":"action","actor":{ADMIN},"device_id":"{device_id}","action_type":"lock","details":{{"type":"restart","force":true}}}}"#
        );
        assert_eq!(gw.handle_text(&mut operator, &request).await.status(), Some(422));
    }

    #[tokio::test]
    async fn hello_redelivers_outstanding_commands() {
        let gw = gateway();
        let (mut agent, _rx, device_id) = enrol(&gw, "kiosk-3").await;
        gw.disconnect(&mut agent);

        let (mut operator, _orx) = session();
        let action = body(gw.handle_text(&mut operator, &lock_request(ADMIN, &device_id)).await);
        assert_eq!(action["status"], "pending");

        let (mut reconnected, mut pushed) = session();
        let hello = format!(r#"{{"op":"hello","device_id":"{device_id}"}}"#);
        let reply = body(gw.handle_text(&mut reconnected, &hello).await);
        assert_eq!(reply["redelivered"], 1);
        let Some(ServerFrame::Command { action: command }) = pushed.recv().await else {
            panic!("expected a redelivered command");
        };
        assert_eq!(command.status.as_str(), "sent");
    }

    #[tokio::test]
    async fn subscribers_receive_events_on_their_topics() {
        let gw = gateway();
        let (mut operator, mut events) = session();

        let reply = body(gw.handle_text(&mut operator, r#"{"op":"subscribe","topics":["policy"]}"#).await);
        assert_eq!(reply["topics"], serde_json::json!(["policy"]));

        let create = format!(
            r#"{{"op":"create_policy_from_template","actor":{SUPERADMIN},"name":"Lab","template":"developer"}}"#
        );
        body(gw.handle_text(&mut operator, &create).await);

        let frame = tokio::time::timeout(Duration::from_secs(1), events.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(frame, ServerFrame::Event { .. }));

        let bad = r#"{"op":"subscribe","topics":["gossip"]}"#;
        assert_eq!(gw.handle_text(&mut operator, bad).await.status(), Some(422));
    }
    #[tokio::test]
    async fn bound_sessions_cannot_claim_another_actor() {
        let gw = gateway();
        let (_victim, _vrx, victim_id) = enrol(&gw, "kiosk-3").await;
        let (mut agent, _rx, device_id) = enrol(&gw, "kiosk-4").await;
        let (mut operator, _orx) = session();

        let action = body(gw.handle_text(&mut operator, &lock_request(ADMIN, &victim_id)).await);
        let action_id = action["id"].as_str().unwrap();
        for actor in [
            r#"{"kind":"system"}"#.to_string(),
            format!(r#"{{"kind":"device","device_id":"{victim_id}"}}"#),
            SUPERADMIN.to_string(),
        ] {
            let fail = format!(
                r#"{{"op":"fail","actor":{actor},"action_id":"{action_id}","error":"spoofed"}}"#
            );
            assert_eq!(gw.handle_text(&mut agent, &fail).await.status(), Some(422));
        }
        assert_eq!(
            gw.plane().action(&action_id.parse().unwrap()).unwrap().status.as_str(),
            "sent"
        );

        // Naming itself is fine.
        let own = format!(
            r#"{{"op":"lock_screen_attempt","actor":{{"kind":"device","device_id":"{device_id}"}},"success":false}}"#
        );
        assert_eq!(gw.handle_text(&mut agent, &own).await.status(), Some(200));
    }

    #[tokio::test]
    async fn lock_screen_attempts_reach_the_lockout_guard() {
        let gw = gateway();
        let (mut agent, _rx, device_id) = enrol(&gw, "kiosk-3").await;
        let wrong = r#"{"op":"lock_screen_attempt","success":false}"#;

        let first = body(gw.handle_text(&mut agent, wrong).await);
        assert_eq!(first["device_id"], device_id.as_str());
        assert_eq!(first["outcome"]["result"], "failed");
        assert_eq!(first["outcome"]["remaining_attempts"], 2);
        body(gw.handle_text(&mut agent, wrong).await);
        let third = body(gw.handle_text(&mut agent, wrong).await);
        assert_eq!(third["outcome"]["result"], "locked_out");

        let right = r#"{"op":"lock_screen_attempt","success":true}"#;
        assert_eq!(gw.handle_text(&mut agent, right).await.status(), Some(423));

        let (mut operator, _orx) = session();
        let anonymous = format!(r#"{{"op":"lock_screen_attempt","device_id":"{device_id}","success":true}}"#);
        assert_eq!(gw.handle_text(&mut operator, &anonymous).await.status(), Some(422));
    }

    #[tokio::test]
    async fn slow_subscribers_do_not_grow_their_queue() {
        let gw = gateway();
        let (tx, mut events) = mpsc::channel(2);
        let mut operator = Session::new(tx);
        body(gw.handle_text(&mut operator, r#"{"op":"subscribe","topics":["policy"]}"#).await);

        for n in 0..6 {
            let create = format!(
                r#"{{"op":"create_policy_from_template","actor":{SUPERADMIN},"name":"Lab {n}","template":"developer"}}"#
            );
            body(gw.handle_text(&mut operator, &create).await);
        }
        tokio::time::sleep(Duration::from_millis(50)).await;

        let mut queued = 0;
        while events.try_recv().is_ok() {
            queued += 1;
        }
        assert_eq!(queued, 2);

        // Once drained, the forwarder picks up where it stopped.
        let next = tokio::time::timeout(Duration::from_secs(1), events.recv())
            .await
            .unwrap();
        assert!(matches!(next, Some(ServerFrame::Event { .. })));
    }
}

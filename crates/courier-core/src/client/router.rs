//! Server selection.
//!
//! Five built-in strategies pick a server id for a server type from the
//! station's online servers. Cursors, counters and rings persist across
//! calls for the lifetime of the client. A custom routing function can
//! replace the built-ins entirely. With neither configured, a session's uid
//! pins it to one server through its CRC-32.

use super::consistent_hash::ConsistentHash;
use super::mailstation::MailStation;
use super::registry::{MembershipSource, ServerInfo};
use crate::config::{ClientOptions, HashAlgorithm, RouteStrategy};
use crate::protocol::RpcMessage;
use crate::{Result, RpcError};
use rand::Rng;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::debug;

/// Caller-supplied routing hint, typically a session or user id.
pub type RouteParam = serde_json::Value;

/// `(route_param, msg, membership) -> server id`.
pub type CustomRouter =
    Arc<dyn Fn(&RouteParam, &RpcMessage, &dyn MembershipSource) -> Result<String> + Send + Sync>;

#[derive(Debug, Clone, Copy)]
struct WrrCursor {
    index: i64,
    weight: i64,
}

impl Default for WrrCursor {
    fn default() -> Self {
        Self {
            index: -1,
            weight: 0,
        }
    }
}

#[derive(Debug, Default)]
struct RouterState {
    rr: HashMap<String, usize>,
    wrr: HashMap<String, WrrCursor>,
    /// Calls handed out per server, per server type.
    active: HashMap<String, HashMap<String, u64>>,
    rings: HashMap<String, Arc<ConsistentHash>>,
}

pub struct Router {
    strategy: Option<RouteStrategy>,
    custom: Option<CustomRouter>,
    context: Option<Arc<dyn MembershipSource>>,
    replicas: usize,
    algorithm: HashAlgorithm,
    hash_field_index: Option<usize>,
    state: Mutex<RouterState>,
}

impl Router {
    /// Capture the routing settings from client options.
    pub fn new(opts: &ClientOptions) -> Self {
        Self {
            strategy: opts.router_type,
            custom: opts.router.clone(),
            context: opts.route_context.clone(),
            replicas: opts.replicas,
            algorithm: opts.algorithm,
            hash_field_index: opts.hash_field_index,
            state: Mutex::new(RouterState::default()),
        }
    }

    /// Pick the server that should receive `msg`.
    ///
    /// A configured `router_type` wins, then the custom router, then the
    /// uid-based default route.
    pub fn route(
        &self,
        station: &MailStation,
        route_param: &RouteParam,
        msg: &RpcMessage,
    ) -> Result<String> {
        match (self.strategy, &self.custom) {
            (Some(strategy), _) => self.select(strategy, station, msg),
            (None, Some(custom)) => match &self.context {
                Some(context) => custom(route_param, msg, context.as_ref()),
                None => custom(route_param, msg, station),
            },
            (None, None) => match &self.context {
                Some(context) => default_route(route_param, msg, context.as_ref()),
                None => default_route(route_param, msg, station),
            },
        }
    }

    /// Run a built-in strategy over the online servers of `msg.server_type`.
    pub fn select(
        &self,
        strategy: RouteStrategy,
        station: &MailStation,
        msg: &RpcMessage,
    ) -> Result<String> {
        let server_type = msg.server_type.as_str();
        let servers = station.servers_by_type(server_type);
        if servers.is_empty() {
            return Err(RpcError::NoServersForType {
                server_type: server_type.to_string(),
            });
        }

        let mut state = self.state();
        match strategy {
            RouteStrategy::Random => Ok(random(&servers)),
            RouteStrategy::RoundRobin => Ok(round_robin(&mut state, server_type, &servers)),
            RouteStrategy::WeightedRoundRobin => {
                weighted_round_robin(&mut state, server_type, &servers)
            }
            RouteStrategy::LeastActive => Ok(least_active(&mut state, server_type, &servers)),
            RouteStrategy::ConsistentHash => {
                let ring = self.ring(&mut state, station, server_type, &servers);
                let key = self.hash_key(msg)?;
                ring.get_node(&key).ok_or_else(|| RpcError::NoServersForType {
                    server_type: server_type.to_string(),
                })
            }
        }
    }

    /// Active-call counters for a server type, as seen by least-active.
    pub fn active_counts(&self, server_type: &str) -> HashMap<String, u64> {
        self.state().active.get(server_type).cloned().unwrap_or_default()
    }

    /// The cached ring for a type, built from `servers` on first use and
    /// kept current through station membership events.
    fn ring(
        &self,
        state: &mut RouterState,
        station: &MailStation,
        server_type: &str,
        servers: &[ServerInfo],
    ) -> Arc<ConsistentHash> {
        if let Some(ring) = state.rings.get(server_type) {
            return ring.clone();
        }
        let ring = Arc::new(ConsistentHash::new(
            server_type,
            servers.iter().map(|s| s.id.as_str()),
            self.replicas,
            self.algorithm,
        ));
        station.add_listener(ring.clone());
        state.rings.insert(server_type.to_string(), ring.clone());
        debug!("built hash ring for {}", server_type);
        ring
    }

    /// The configured argument as text, or the whole message as JSON.
    fn hash_key(&self, msg: &RpcMessage) -> Result<String> {
        match self.hash_field_index.and_then(|i| msg.args.get(i)) {
            Some(serde_json::Value::String(s)) => Ok(s.clone()),
            Some(other) => Ok(other.to_string()),
            None => Ok(serde_json::to_string(msg)?),
        }
    }

    fn state(&self) -> MutexGuard<'_, RouterState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl std::fmt::Debug for Router {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Router")
            .field("strategy", &self.strategy)
            .field("custom", &self.custom.is_some())
            .field("replicas", &self.replicas)
            .field("algorithm", &self.algorithm)
            .field("hash_field_index", &self.hash_field_index)
            .finish()
    }
}

/// `crc32(uid) % n` over the servers of the message's type.
///
/// The uid is read from a session object's `uid` field, or taken from a bare
/// string or number; anything else hashes the empty string.
fn default_route(
    route_param: &RouteParam,
    msg: &RpcMessage,
    membership: &dyn MembershipSource,
) -> Result<String> {
    let servers = membership.servers_by_type(&msg.server_type);
    if servers.is_empty() {
        return Err(RpcError::NoServersForType {
            server_type: msg.server_type.clone(),
        });
    }
    let uid = session_uid(route_param);
    let idx = crc32fast::hash(uid.as_bytes()) as usize % servers.len();
    Ok(servers[idx].id.clone())
}

fn session_uid(route_param: &RouteParam) -> String {
    use serde_json::Value;
    let uid = match route_param {
        Value::Object(session) => session.get("uid").unwrap_or(&Value::Null),
        other => other,
    };
    match uid {
        Value::String(s) => s.clone(),
        Value::Number(n) => n.to_string(),
        _ => String::new(),
    }
}

fn random(servers: &[ServerInfo]) -> String {
    let idx = rand::rng().random_range(0..servers.len());
    servers[idx].id.clone()
}

fn round_robin(state: &mut RouterState, server_type: &str, servers: &[ServerInfo]) -> String {
    let cursor = state.rr.entry(server_type.to_string()).or_insert(0);
    if *cursor >= servers.len() {
        *cursor = 0;
    }
    let id = servers[*cursor].id.clone();
    *cursor += 1;
    id
}

/// Smooth weighted round-robin: every time the cursor wraps, the weight
/// budget drops by one and resets to the maximum weight once it reaches
/// zero. A server is picked when its weight covers the current budget.
fn weighted_round_robin(
    state: &mut RouterState,
    server_type: &str,
    servers: &[ServerInfo],
) -> Result<String> {
    let max_weight = servers
        .iter()
        .map(|s| i64::from(s.weight.unwrap_or(0)))
        .max()
        .unwrap_or(0);
    if max_weight <= 0 {
        return Err(RpcError::Route {
            server_type: server_type.to_string(),
            message: "no server has a positive weight".to_string(),
        });
    }

    let cursor = state.wrr.entry(server_type.to_string()).or_default();
    let len = servers.len() as i64;
    loop {
        cursor.index = (cursor.index + 1).rem_euclid(len);
        if cursor.index == 0 {
            cursor.weight -= 1;
            if cursor.weight <= 0 {
                cursor.weight = max_weight;
            }
        }
        let server = &servers[cursor.index as usize];
        if i64::from(server.weight.unwrap_or(0)) >= cursor.weight {
            return Ok(server.id.clone());
        }
    }
}

/// Pick uniformly among the servers with the fewest recorded calls.
///
/// Counters only grow: a call is counted when routed, never when it ends.
fn least_active(state: &mut RouterState, server_type: &str, servers: &[ServerInfo]) -> String {
    let counts = state.active.entry(server_type.to_string()).or_default();
    for server in servers {
        counts.entry(server.id.clone()).or_insert(0);
    }
    let min = servers
        .iter()
        .map(|s| counts[&s.id])
        .min()
        .unwrap_or(0);
    let ties: Vec<&ServerInfo> = servers.iter().filter(|s| counts[&s.id] == min).collect();

    let pick = ties[rand::rng().random_range(0..ties.len())].id.clone();
    *counts.entry(pick.clone()).or_insert(0) += 1;
    pick
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Namespace;
    use serde_json::json;

    fn station(servers: Vec<ServerInfo>) -> MailStation {
        let station = MailStation::new(&ClientOptions::new());
        station.add_servers(servers);
        station
    }

    fn worker(id: &str) -> ServerInfo {
        ServerInfo::new(id, "127.0.0.1", 4000, "worker")
    }

    fn msg() -> RpcMessage {
        RpcMessage::new(Namespace::User, "worker", "jobRemote", "run")
    }

    fn router(strategy: RouteStrategy) -> Router {
        Router::new(&ClientOptions::new().with_router_type(strategy))
    }

    #[test]
    fn test_round_robin_alternates() {
        let station = station(vec![worker("A"), worker("B")]);
        let router = router(RouteStrategy::RoundRobin);
        let picks: Vec<String> = (0..4)
            .map(|_| router.route(&station, &json!(null), &msg()).unwrap())
            .collect();
        assert_eq!(picks, vec!["A", "B", "A", "B"]);
    }

    #[test]
    fn test_round_robin_visits_each_node_once() {
        let ids: Vec<String> = (0..7).map(|i| format!("w-{}", i)).collect();
        let station = station(ids.iter().map(|id| worker(id)).collect());
        let router = router(RouteStrategy::RoundRobin);
        let picks: Vec<String> = (0..7)
            .map(|_| router.route(&station, &json!(null), &msg()).unwrap())
            .collect();
        assert_eq!(picks, ids);
    }

    #[test]
    fn test_round_robin_survives_shrinking_list() {
        let station = station(vec![worker("A"), worker("B"), worker("C")]);
        let router = router(RouteStrategy::RoundRobin);
        router.route(&station, &json!(null), &msg()).unwrap();
        router.route(&station, &json!(null), &msg()).unwrap();
        station.remove_server("C");
        station.remove_server("B");
        assert_eq!(router.route(&station, &json!(null), &msg()).unwrap(), "A");
    }

    #[test]
    fn test_weighted_round_robin_ratio() {
        let station = station(vec![worker("a").with_weight(3), worker("b").with_weight(1)]);
        let router = router(RouteStrategy::WeightedRoundRobin);
        let mut counts: HashMap<String, usize> = HashMap::new();
        for _ in 0..400 {
            let id = router.route(&station, &json!(null), &msg()).unwrap();
            *counts.entry(id).or_default() += 1;
        }
        assert_eq!(counts["a"], 300);
        assert_eq!(counts["b"], 100);
    }

    #[test]
    fn test_weighted_round_robin_needs_weights() {
        let station = station(vec![worker("a"), worker("b")]);
        let router = router(RouteStrategy::WeightedRoundRobin);
        assert!(matches!(
            router.route(&station, &json!(null), &msg()),
            Err(RpcError::Route { .. })
        ));
    }

    #[test]
    fn test_least_active_prefers_idle_node() {
        let station = station(vec![worker("A"), worker("B"), worker("C")]);
        let router = router(RouteStrategy::LeastActive);
        let first = router.route(&station, &json!(null), &msg()).unwrap();
        let second = router.route(&station, &json!(null), &msg()).unwrap();
        let third = router.route(&station, &json!(null), &msg()).unwrap();

        let mut picks = vec![first, second, third];
        picks.sort();
        assert_eq!(picks, vec!["A", "B", "C"]);

        let counts = router.active_counts("worker");
        assert!(counts.values().all(|c| *c == 1));
    }

    #[test]
    fn test_least_active_never_skips_minimum() {
        let station = station(vec![worker("A"), worker("B")]);
        let router = router(RouteStrategy::LeastActive);
        for _ in 0..50 {
            let counts = router.active_counts("worker");
            let a = counts.get("A").copied().unwrap_or(0);
            let b = counts.get("B").copied().unwrap_or(0);
            let pick = router.route(&station, &json!(null), &msg()).unwrap();
            if a < b {
                assert_eq!(pick, "A");
            } else if b < a {
                assert_eq!(pick, "B");
            }
        }
    }

    #[test]
    fn test_random_stays_in_type() {
        let mut servers = vec![worker("A"), worker("B")];
        servers.push(ServerInfo::new("X", "127.0.0.1", 4001, "other"));
        let station = station(servers);
        let router = router(RouteStrategy::Random);
        for _ in 0..20 {
            let id = router.route(&station, &json!(null), &msg()).unwrap();
            assert!(id == "A" || id == "B");
        }
    }

    #[test]
    fn test_default_route_pins_uid() {
        let station = station(vec![worker("A"), worker("B"), worker("C")]);
        let router = Router::new(&ClientOptions::new());

        // crc32("1001") % 3 == 2, crc32("uid-1") % 3 == 1, crc32("") == 0.
        for _ in 0..5 {
            assert_eq!(router.route(&station, &json!({"uid": 1001}), &msg()).unwrap(), "C");
            assert_eq!(router.route(&station, &json!("1001"), &msg()).unwrap(), "C");
            assert_eq!(router.route(&station, &json!({"uid": "uid-1"}), &msg()).unwrap(), "B");
        }
        assert_eq!(router.route(&station, &json!(null), &msg()).unwrap(), "A");
        assert_eq!(router.route(&station, &json!({"sid": 4}), &msg()).unwrap(), "A");
    }

    #[test]
    fn test_default_route_needs_servers() {
        let station = station(vec![]);
        let router = Router::new(&ClientOptions::new());
        assert!(matches!(
            router.route(&station, &json!({"uid": 7}), &msg()),
            Err(RpcError::NoServersForType { .. })
        ));
    }

    #[test]
    fn test_empty_type_errors() {
        let station = station(vec![]);
        for strategy in [
            RouteStrategy::Random,
            RouteStrategy::RoundRobin,
            RouteStrategy::LeastActive,
            RouteStrategy::ConsistentHash,
        ] {
            assert!(matches!(
                router(strategy).route(&station, &json!(null), &msg()),
                Err(RpcError::NoServersForType { .. })
            ));
        }
    }

    #[test]
    fn test_consistent_hash_is_sticky_per_field() {
        let station = station(vec![worker("A"), worker("B"), worker("C")]);
        let router = Router::new(
            &ClientOptions::new()
                .with_router_type(RouteStrategy::ConsistentHash)
                .with_hash_field_index(0),
        );
        let call = |uid: &str| msg().with_args(vec![json!(uid), json!({"x": 1})]);

        for i in 0..20 {
            let uid = format!("uid-{}", i);
            let first = router.route(&station, &json!(null), &call(&uid)).unwrap();
            let again = router.route(&station, &json!(null), &call(&uid)).unwrap();
            assert_eq!(first, again);
        }
    }

    #[test]
    fn test_consistent_hash_follows_membership() {
        let station = station(vec![worker("A"), worker("B")]);
        let router = router(RouteStrategy::ConsistentHash);
        let calls: Vec<RpcMessage> = (0..50)
            .map(|i| msg().with_args(vec![json!(i)]))
            .collect();
        for call in &calls {
            router.route(&station, &json!(null), call).unwrap();
        }

        station.remove_server("A");
        for call in &calls {
            assert_eq!(router.route(&station, &json!(null), call).unwrap(), "B");
        }
    }

    #[test]
    fn test_custom_router_sees_route_param() {
        let station = station(vec![worker("A"), worker("B")]);
        let custom: CustomRouter = Arc::new(
            |param: &RouteParam, msg: &RpcMessage, membership: &dyn MembershipSource| -> Result<String> {
                let servers = membership.servers_by_type(&msg.server_type);
                let idx = param.as_u64().unwrap_or(0) as usize % servers.len();
                Ok(servers[idx].id.clone())
            },
        );
        let router = Router::new(&ClientOptions::new().with_router(custom));
        assert_eq!(router.route(&station, &json!(1), &msg()).unwrap(), "B");
        assert_eq!(router.route(&station, &json!(2), &msg()).unwrap(), "A");
    }

    #[test]
    fn test_router_type_beats_custom_router() {
        let station = station(vec![worker("A"), worker("B")]);
        let custom: CustomRouter = Arc::new(
            |_: &RouteParam, _: &RpcMessage, _: &dyn MembershipSource| -> Result<String> {
                Ok("nowhere".to_string())
            },
        );
        let router = Router::new(
            &ClientOptions::new()
                .with_router(custom)
                .with_router_type(RouteStrategy::RoundRobin),
        );
        assert_eq!(router.route(&station, &json!(null), &msg()).unwrap(), "A");
    }
}

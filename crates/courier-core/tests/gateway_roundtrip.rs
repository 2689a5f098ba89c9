//! End-to-end tests: a real gateway on a loopback port driven by a client.

use courier_core::{
    CallOptions, Client, ClientOptions, Gateway, Namespace, ProxyRecord, RouteStrategy, RpcError,
    RpcMessage, ServerInfo, ServerOptions, ServerTarget, Service, ServiceCatalog,
    ServiceInterface, WireFormat,
};
use serde_json::{json, Value};
use std::time::Duration;

const SERVER_TYPE: &str = "area";

/// Catalog served by every test gateway; `whoami` answers with `node_id`.
fn catalog(node_id: &str) -> ServiceCatalog {
    let id = node_id.to_string();
    let area = Service::new("areaRemote")
        .sync_method("whoami", move |_| Ok(vec![json!(id)]))
        .sync_method("add", |args| {
            let sum: i64 = args.iter().filter_map(Value::as_i64).sum();
            Ok(vec![json!(sum)])
        })
        .sync_method("fail", |_| {
            Err(RpcError::Validation {
                field: "args".to_string(),
                message: "always fails".to_string(),
            })
        })
        .method("sleep", |args: Vec<Value>| async move {
            let ms = args.first().and_then(Value::as_u64).unwrap_or(0);
            tokio::time::sleep(Duration::from_millis(ms)).await;
            Ok(vec![json!(ms)])
        });
    let sys = Service::new("sysRemote").sync_method("ping", |_| Ok(vec![json!("pong")]));
    ServiceCatalog::new()
        .with_service(Namespace::User, area)
        .with_service(Namespace::Sys, sys)
}

async fn start_gateway(
    node_id: &str,
    configure: impl FnOnce(ServerOptions) -> ServerOptions,
) -> (Gateway, u16) {
    let opts = configure(ServerOptions::new(0).with_host("127.0.0.1"));
    let gateway = Gateway::new(opts, catalog(node_id)).expect("Failed to build gateway");
    let addr = gateway.start().await.expect("Failed to start gateway");
    (gateway, addr.port())
}

async fn start_client(opts: ClientOptions, peers: &[(&str, u16)]) -> Client {
    let client = Client::new(opts.with_connect_timeout(Duration::from_secs(2))).unwrap();
    for (id, port) in peers {
        client.add_server(ServerInfo::new(*id, "127.0.0.1", *port, SERVER_TYPE));
    }
    client.start().await.unwrap();
    client
}

fn area_call(method: &str, args: Vec<Value>) -> RpcMessage {
    RpcMessage::new(Namespace::User, SERVER_TYPE, "areaRemote", method).with_args(args)
}

#[tokio::test]
async fn test_json_roundtrip() {
    let (gateway, port) = start_gateway("area-1", |o| o).await;
    let client = start_client(ClientOptions::new(), &[("area-1", port)]).await;

    let reply = client
        .rpc_invoke("area-1", area_call("add", vec![json!(2), json!(40)]), CallOptions::default())
        .await
        .unwrap();
    assert_eq!(reply, vec![json!(42)]);

    let sys = RpcMessage::new(Namespace::Sys, SERVER_TYPE, "sysRemote", "ping");
    let reply = client
        .rpc_invoke("area-1", sys, CallOptions::default())
        .await
        .unwrap();
    assert_eq!(reply, vec![json!("pong")]);
    assert!(client.station().has_mailbox("area-1"));

    client.stop(true).unwrap();
    gateway.stop().unwrap();
}

#[tokio::test]
async fn test_binary_roundtrip() {
    let table = catalog("area-1").service_table().unwrap();
    let (gateway, port) = start_gateway("area-1", |o| {
        o.with_wire_format(WireFormat::binary(table.clone()))
    })
    .await;
    let client = start_client(
        ClientOptions::new().with_wire_format(WireFormat::binary(table)),
        &[("area-1", port)],
    )
    .await;

    let reply = client
        .rpc_invoke(
            "area-1",
            area_call("add", vec![json!(1), json!(2), json!(3)]),
            CallOptions::default(),
        )
        .await
        .unwrap();
    assert_eq!(reply, vec![json!(6)]);

    let reply = client
        .rpc_invoke("area-1", area_call("whoami", vec![]), CallOptions::default())
        .await
        .unwrap();
    assert_eq!(reply, vec![json!("area-1")]);

    client.stop(true).unwrap();
    gateway.stop().unwrap();
}

#[tokio::test]
async fn test_buffered_concurrent_calls() {
    let (gateway, port) = start_gateway("area-1", |o| {
        o.with_buffer_msg(true)
            .with_interval(Duration::from_millis(10))
    })
    .await;
    let client = start_client(
        ClientOptions::new()
            .with_buffer_msg(true)
            .with_interval(Duration::from_millis(10)),
        &[("area-1", port)],
    )
    .await;

    let calls = (0..20i64).map(|i| {
        client.rpc_invoke(
            "area-1",
            area_call("add", vec![json!(i), json!(1)]),
            CallOptions::default(),
        )
    });
    let replies = futures::future::join_all(calls).await;
    for (i, reply) in replies.into_iter().enumerate() {
        assert_eq!(reply.unwrap(), vec![json!(i as i64 + 1)]);
    }

    client.stop(true).unwrap();
    gateway.stop().unwrap();
}

#[tokio::test]
async fn test_remote_errors_reach_caller() {
    let (gateway, port) = start_gateway("area-1", |o| o).await;
    let client = start_client(ClientOptions::new(), &[("area-1", port)]).await;

    match client
        .rpc_invoke("area-1", area_call("fail", vec![]), CallOptions::default())
        .await
    {
        Err(RpcError::Remote { message, .. }) => assert!(message.contains("always fails")),
        other => panic!("Expected remote error, got: {:?}", other),
    }

    match client
        .rpc_invoke("area-1", area_call("missing", vec![]), CallOptions::default())
        .await
    {
        Err(RpcError::Remote { message, .. }) => assert!(message.contains("missing")),
        other => panic!("Expected remote error, got: {:?}", other),
    }

    // The connection survives failed calls.
    let reply = client
        .rpc_invoke("area-1", area_call("add", vec![json!(1)]), CallOptions::default())
        .await
        .unwrap();
    assert_eq!(reply, vec![json!(1)]);

    client.stop(true).unwrap();
    gateway.stop().unwrap();
}

#[tokio::test]
async fn test_request_timeout() {
    let (gateway, port) = start_gateway("area-1", |o| o).await;
    let client = start_client(ClientOptions::new(), &[("area-1", port)]).await;

    // Connect first so the short timeout only covers the request itself.
    client
        .rpc_invoke("area-1", area_call("add", vec![]), CallOptions::default())
        .await
        .unwrap();

    let opts = CallOptions::new().with_timeout(Duration::from_millis(100));
    match client
        .rpc_invoke("area-1", area_call("sleep", vec![json!(1000)]), opts)
        .await
    {
        Err(RpcError::RequestTimeout { server_id, .. }) => assert_eq!(server_id, "area-1"),
        other => panic!("Expected request timeout, got: {:?}", other),
    }

    client.stop(true).unwrap();
    gateway.stop().unwrap();
}

#[tokio::test]
async fn test_unreachable_peer_fails() {
    // Bind and drop a listener to get a port nobody listens on.
    let port = {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap().port()
    };
    let client = start_client(ClientOptions::new(), &[("area-9", port)]).await;

    // A refused connect leaves the call queued until its timeout runs out.
    let opts = CallOptions::new().with_timeout(Duration::from_millis(300));
    let result = client
        .rpc_invoke("area-9", area_call("add", vec![]), opts)
        .await;
    assert!(matches!(result, Err(RpcError::ConnectTimeout { .. })));
    assert!(!client.station().has_mailbox("area-9"));
    assert!(!client.station().is_connecting("area-9"));

    client.stop(true).unwrap();
}

#[tokio::test]
async fn test_round_robin_across_gateways() {
    let (gw_a, port_a) = start_gateway("area-1", |o| o).await;
    let (gw_b, port_b) = start_gateway("area-2", |o| o).await;
    let client = start_client(
        ClientOptions::new().with_router_type(RouteStrategy::RoundRobin),
        &[("area-1", port_a), ("area-2", port_b)],
    )
    .await;

    let mut seen = Vec::new();
    for _ in 0..4 {
        let msg = area_call("whoami", vec![]);
        let server_id = client.route(&Value::Null, &msg).unwrap();
        let reply = client
            .rpc_invoke(server_id.clone(), msg, CallOptions::default())
            .await
            .unwrap();
        assert_eq!(reply, vec![json!(server_id)]);
        seen.push(server_id);
    }
    assert_ne!(seen[0], seen[1]);
    assert_eq!(seen[0], seen[2]);
    assert_eq!(seen[1], seen[3]);

    client.stop(true).unwrap();
    gw_a.stop().unwrap();
    gw_b.stop().unwrap();
}

#[tokio::test]
async fn test_proxy_invoke_and_broadcast() {
    let (gw_a, port_a) = start_gateway("area-1", |o| o).await;
    let (gw_b, port_b) = start_gateway("area-2", |o| o).await;
    let client = start_client(ClientOptions::new(), &[("area-1", port_a), ("area-2", port_b)]).await;

    client.add_proxy(ProxyRecord::new(
        Namespace::User,
        SERVER_TYPE,
        ServiceInterface::new("areaRemote")
            .with_method("whoami")
            .with_method_arity("add", 2),
    ));
    let proxy = client
        .proxy(Namespace::User, SERVER_TYPE, "areaRemote")
        .expect("proxy registered");

    let reply = proxy
        .invoke(json!("uid-7"), "add", vec![json!(5), json!(6)])
        .await
        .unwrap();
    assert_eq!(reply, vec![json!(11)]);

    // Arity and method declarations are checked before anything is sent.
    assert!(matches!(
        proxy.invoke(Value::Null, "add", vec![json!(1)]).await,
        Err(RpcError::Validation { .. })
    ));
    assert!(matches!(
        proxy.invoke(Value::Null, "fail", vec![]).await,
        Err(RpcError::NoSuchMethod(_))
    ));

    let direct = proxy.to_server("area-2", "whoami", vec![]).await.unwrap();
    assert_eq!(direct, vec![json!("area-2")]);

    let all = proxy
        .to_server(ServerTarget::All, "whoami", vec![])
        .await
        .unwrap();
    let mut ids: Vec<Value> = all
        .into_iter()
        .map(|reply| match reply {
            Value::Array(mut values) => values.remove(0),
            other => panic!("Expected one array per server, got: {:?}", other),
        })
        .collect();
    ids.sort_by_key(|v| v.to_string());
    assert_eq!(ids, vec![json!("area-1"), json!("area-2")]);

    client.stop(true).unwrap();
    gw_a.stop().unwrap();
    gw_b.stop().unwrap();
}

#[tokio::test]
async fn test_gateway_catalog_swap_is_live() {
    let (gateway, port) = start_gateway("area-1", |o| o).await;
    let client = start_client(ClientOptions::new(), &[("area-1", port)]).await;

    let reply = client
        .rpc_invoke("area-1", area_call("whoami", vec![]), CallOptions::default())
        .await
        .unwrap();
    assert_eq!(reply, vec![json!("area-1")]);

    gateway.replace_catalog(catalog("area-1b"));
    let reply = client
        .rpc_invoke("area-1", area_call("whoami", vec![]), CallOptions::default())
        .await
        .unwrap();
    assert_eq!(reply, vec![json!("area-1b")]);

    client.stop(true).unwrap();
    gateway.stop().unwrap();
}

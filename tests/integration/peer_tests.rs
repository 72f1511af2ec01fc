//! Integration tests for the RPC peer over in-memory duplex streams.
//!
//! A scripted fake agent drives the other end of the pipe, covering the
//! handshake, out-of-order correlation, notification fan-out ordering,
//! reverse approval requests, timeouts, and close semantics.

use flint_gateway::protocol::peer::{
    ApprovalDecision, PeerOptions, RpcPeer, APPROVAL_METHODS,
};
use serde_json::{json, Value};
use tokio::io::{duplex, split, AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream};

type AgentLines = tokio::io::Lines<BufReader<tokio::io::ReadHalf<DuplexStream>>>;
type AgentWrite = tokio::io::WriteHalf<DuplexStream>;

/// Wire up a peer and hand back the fake agent's side of the pipe.
fn connect(options: &PeerOptions) -> (RpcPeer, AgentLines, AgentWrite) {
    let (gateway_io, agent_io) = duplex(64 * 1024);
    let (gateway_read, gateway_write) = split(gateway_io);
    let peer = RpcPeer::start(gateway_write, gateway_read, options);

    let (agent_read, agent_write) = split(agent_io);
    (peer, BufReader::new(agent_read).lines(), agent_write)
}

async fn read_frame(lines: &mut AgentLines) -> Value {
    let line = lines
        .next_line()
        .await
        .expect("agent read")
        .expect("agent stream open");
    serde_json::from_str(&line).expect("gateway frames are valid json")
}

async fn write_frame(writer: &mut AgentWrite, frame: &Value) {
    writer
        .write_all(format!("{frame}\n").as_bytes())
        .await
        .expect("agent write");
}

// ── Handshake ─────────────────────────────────────────────────────────────────

#[tokio::test]
async fn initialize_handshake_sends_initialized_after_the_result() {
    let options = PeerOptions::default();
    let (peer, mut lines, mut writer) = connect(&options);

    let agent = tokio::spawn(async move {
        let frame = read_frame(&mut lines).await;
        assert_eq!(frame["method"], "initialize");
        assert_eq!(frame["params"]["clientInfo"]["name"], "flint-gateway");
        let response = json!({
            "id": frame["id"],
            "result": { "agentInfo": { "name": "fake-agent" } }
        });
        write_frame(&mut writer, &response).await;

        let notified = read_frame(&mut lines).await;
        assert_eq!(notified["method"], "initialized");
        assert!(notified.get("id").is_none(), "initialized is a notification");
        (lines, writer)
    });

    let info = peer.initialize(&options).await.expect("handshake");
    assert_eq!(info["agentInfo"]["name"], "fake-agent");
    agent.await.expect("agent script");
}

// ── Correlation ───────────────────────────────────────────────────────────────

#[tokio::test]
async fn responses_route_by_id_even_out_of_order() {
    let options = PeerOptions::default();
    let (peer, mut lines, mut writer) = connect(&options);

    let agent = tokio::spawn(async move {
        let first = read_frame(&mut lines).await;
        let second = read_frame(&mut lines).await;
        // Answer in reverse order; each response echoes its request id.
        for frame in [&second, &first] {
            let response = json!({ "id": frame["id"], "result": { "echo": frame["id"] } });
            write_frame(&mut writer, &response).await;
        }
    });

    let (a, b) = tokio::join!(
        peer.request("state/get", json!({ "n": 1 })),
        peer.request("state/get", json!({ "n": 2 })),
    );

    let a = a.expect("first response");
    let b = b.expect("second response");
    assert_ne!(a["echo"], b["echo"], "each caller gets its own response");
    agent.await.expect("agent script");
}

#[tokio::test]
async fn error_responses_reject_the_pending_call() {
    let options = PeerOptions::default();
    let (peer, mut lines, mut writer) = connect(&options);

    let agent = tokio::spawn(async move {
        let frame = read_frame(&mut lines).await;
        let response = json!({
            "id": frame["id"],
            "error": { "code": -32000, "message": "thread not found" }
        });
        write_frame(&mut writer, &response).await;
    });

    let err = peer
        .request("thread/resume", json!({ "threadId": "ghost" }))
        .await
        .expect_err("error response must reject");
    assert!(err.to_string().contains("thread not found"), "got: {err}");
    agent.await.expect("agent script");
}

// ── Notification fan-out ──────────────────────────────────────────────────────

#[tokio::test]
async fn all_subscribers_observe_notifications_in_emission_order() {
    let options = PeerOptions::default();
    let (peer, _lines, mut writer) = connect(&options);

    let mut first = peer.subscribe();
    let mut second = peer.subscribe();

    for n in 0..3 {
        write_frame(
            &mut writer,
            &json!({ "method": "item/agentMessage/delta", "params": { "delta": n.to_string() } }),
        )
        .await;
    }

    for subscriber in [&mut first, &mut second] {
        for expected in ["0", "1", "2"] {
            let notification = subscriber.recv().await.expect("notification");
            assert_eq!(notification.method, "item/agentMessage/delta");
            assert_eq!(notification.params["delta"], expected);
        }
    }
}

#[tokio::test]
async fn dropped_subscribers_stop_receiving() {
    let options = PeerOptions::default();
    let (peer, _lines, mut writer) = connect(&options);

    let mut kept = peer.subscribe();
    let dropped = peer.subscribe();
    drop(dropped);

    write_frame(&mut writer, &json!({ "method": "turn/started", "params": {} })).await;
    let notification = kept.recv().await.expect("kept subscriber still receives");
    assert_eq!(notification.method, "turn/started");
}

// ── Reverse requests ──────────────────────────────────────────────────────────

/// An approval request always gets a response on stdin and
/// surfaces exactly one activity beat to listeners.
#[tokio::test]
async fn approval_requests_are_answered_and_fanned_out() {
    let options = PeerOptions::default();
    let (peer, mut lines, mut writer) = connect(&options);
    let mut subscriber = peer.subscribe();

    write_frame(
        &mut writer,
        &json!({
            "id": "app-1",
            "method": APPROVAL_METHODS[0],
            "params": { "command": "rm -rf build" }
        }),
    )
    .await;

    let response = read_frame(&mut lines).await;
    assert_eq!(response["id"], "app-1");
    assert_eq!(response["result"]["decision"], "accept");

    let notification = subscriber.recv().await.expect("activity fan-out");
    assert_eq!(notification.method, APPROVAL_METHODS[0]);

    let mut translator = flint_gateway::protocol::translator::EventTranslator::new();
    assert_eq!(
        translator.translate(&notification),
        Some(flint_gateway::models::event::AgentEvent::Activity)
    );
}

#[tokio::test]
async fn configured_decline_is_sent_for_approvals() {
    let options = PeerOptions {
        approval_decision: ApprovalDecision::Decline,
        ..PeerOptions::default()
    };
    let (_peer, mut lines, mut writer) = connect(&options);

    write_frame(
        &mut writer,
        &json!({ "id": 4, "method": APPROVAL_METHODS[1], "params": {} }),
    )
    .await;

    let response = read_frame(&mut lines).await;
    assert_eq!(response["result"]["decision"], "decline");
}

#[tokio::test]
async fn unknown_reverse_requests_get_method_not_supported() {
    let options = PeerOptions::default();
    let (_peer, mut lines, mut writer) = connect(&options);

    write_frame(
        &mut writer,
        &json!({ "id": 9, "method": "item/secrets/requestDump", "params": {} }),
    )
    .await;

    let response = read_frame(&mut lines).await;
    assert_eq!(response["id"], 9);
    assert_eq!(response["error"]["code"], -32601);
    assert_eq!(response["error"]["message"], "method not supported");
}

// ── Timeouts and close ────────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn unanswered_requests_time_out() {
    let options = PeerOptions::default();
    let (peer, _lines, _writer) = connect(&options);

    let err = peer
        .request("turn/interrupt", json!({}))
        .await
        .expect_err("no response must time out");
    assert!(err.to_string().contains("timed out"), "got: {err}");
}

#[tokio::test]
async fn close_rejects_pending_calls_and_ends_streams() {
    let options = PeerOptions::default();
    let (peer, _lines, _writer) = connect(&options);
    let mut subscriber = peer.subscribe();

    let pending = {
        let peer = peer.clone();
        tokio::spawn(async move { peer.request("state/get", json!({})).await })
    };
    tokio::time::sleep(std::time::Duration::from_millis(20)).await;

    peer.close();
    peer.close(); // idempotent

    let err = pending
        .await
        .expect("task joins")
        .expect_err("pending call must be rejected");
    assert!(err.to_string().contains("client closed"), "got: {err}");

    assert!(
        subscriber.recv().await.is_none(),
        "subscriber streams end on close"
    );
    assert!(peer.is_closed());

    let err = peer
        .request("state/get", json!({}))
        .await
        .expect_err("closed peer rejects new calls");
    assert!(err.to_string().contains("client closed"), "got: {err}");
}

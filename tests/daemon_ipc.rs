use serde_json::json;
use shellcue::client::DaemonClient;
use shellcue::config::Config;
use shellcue::daemon::{Daemon, DaemonContext};
use shellcue::protocol::{Request, Status, MAX_REQUEST_BYTES};
use std::io::{Read, Write};
use std::os::unix::net::UnixStream;
use std::path::Path;
use std::time::{Duration, Instant};

fn spawn_daemon(config: Config) -> std::thread::JoinHandle<anyhow::Result<()>> {
    std::thread::spawn(move || {
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;
        let daemon = Daemon::new(DaemonContext::from_config(config)?)?;
        rt.block_on(daemon.run())
    })
}

fn wait_for(client: &DaemonClient) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while !client.is_running() {
        assert!(Instant::now() < deadline, "daemon never came up");
        std::thread::sleep(Duration::from_millis(20));
    }
}

fn raw_exchange(socket: &Path, payload: &[u8]) -> serde_json::Value {
    let mut stream = UnixStream::connect(socket).unwrap();
    stream.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
    stream.write_all(payload).unwrap();
    let mut out = String::new();
    stream.read_to_string(&mut out).unwrap();
    serde_json::from_str(out.trim_end()).unwrap()
}

#[test]
fn daemon_serves_requests_and_cleans_up() {
    let dir = tempfile::tempdir().unwrap();
    let config = Config::rooted_at(dir.path());
    let socket = config.daemon.socket_path.clone();
    let pid_file = config.daemon.pid_path.clone();
    let handle = spawn_daemon(config);

    let client = DaemonClient::new(&socket);
    wait_for(&client);
    assert!(pid_file.exists());

    for _ in 0..3 {
        let logged = client
            .send(&Request::LogCommand {
                command: "git status".to_string(),
                exit_code: 0,
                duration: Some(0.1),
                cwd: "/x".to_string(),
                session_id: Some("it-session".to_string()),
            })
            .unwrap();
        assert_eq!(logged.status, Status::Ok);
        assert!(logged.get("command_id").unwrap().as_i64().unwrap() > 0);
    }

    let filtered = client
        .send(&Request::LogCommand {
            command: "export TOKEN=abc".to_string(),
            exit_code: 0,
            duration: None,
            cwd: "/x".to_string(),
            session_id: None,
        })
        .unwrap();
    assert_eq!(filtered.status, Status::Filtered);

    let suggest = raw_exchange(
        &socket,
        b"{\"action\":\"complete\",\"partial\":\"git st\",\"cwd\":\"/x\"}\n",
    );
    assert_eq!(suggest["status"], "ok");
    assert_eq!(suggest["suggestions"][0]["command"], "git status");
    assert_eq!(suggest["suggestions"][0]["source"], "exact_prefix");

    let search = client
        .send(&Request::Search {
            query: "status".to_string(),
            limit: 10,
            format: Default::default(),
            cwd: None,
        })
        .unwrap();
    assert_eq!(
        search.get("results"),
        Some(&json!(["git status", "git status", "git status"]))
    );

    let status = client.send(&Request::Status).unwrap();
    assert_eq!(status.get("state"), Some(&json!("running")));
    assert_eq!(status.get("commands_logged"), Some(&json!(3)));
    assert_eq!(status.get("commands_filtered"), Some(&json!(1)));

    let shutdown = client.send(&Request::Shutdown).unwrap();
    assert_eq!(shutdown.status, Status::Ok);
    handle.join().unwrap().unwrap();

    assert!(!socket.exists());
    assert!(!pid_file.exists());
    // three successful commands are too few to train on
    assert!(!dir.path().join("index.bin").exists());
}

#[test]
fn malformed_requests_get_error_responses() {
    let dir = tempfile::tempdir().unwrap();
    let config = Config::rooted_at(dir.path());
    let socket = config.daemon.socket_path.clone();
    let handle = spawn_daemon(config);
    let client = DaemonClient::new(&socket);
    wait_for(&client);

    let garbage = raw_exchange(&socket, b"this is not json\n");
    assert_eq!(garbage["status"], "error");

    let unknown = raw_exchange(&socket, b"{\"action\":\"launch\"}\n");
    assert_eq!(unknown["status"], "error");

    // the daemon is still serving after bad input
    assert!(client.is_running());

    client.send(&Request::Shutdown).unwrap();
    handle.join().unwrap().unwrap();
}

#[test]
fn oversized_request_is_rejected_and_daemon_keeps_serving() {
    let dir = tempfile::tempdir().unwrap();
    let config = Config::rooted_at(dir.path());
    let socket = config.daemon.socket_path.clone();
    let handle = spawn_daemon(config);
    let client = DaemonClient::new(&socket);
    wait_for(&client);

    // no newline, so the daemon keeps reading until it crosses the limit
    let payload = vec![b'a'; MAX_REQUEST_BYTES + 1];
    let response = raw_exchange(&socket, &payload);
    assert_eq!(response["status"], "error");
    assert!(response["error"].as_str().unwrap().contains("exceeded"));

    assert!(client.is_running());
    let status = client.send(&Request::Status).unwrap();
    assert!(status.get("errors").unwrap().as_u64().unwrap() >= 1);

    client.send(&Request::Shutdown).unwrap();
    handle.join().unwrap().unwrap();
}

#[test]
fn stalled_client_times_out() {
    let dir = tempfile::tempdir().unwrap();
    let config = Config::rooted_at(dir.path());
    let socket = config.daemon.socket_path.clone();
    let handle = spawn_daemon(config);
    let client = DaemonClient::new(&socket);
    wait_for(&client);

    let started = Instant::now();
    let mut stalled = UnixStream::connect(&socket).unwrap();
    stalled.set_read_timeout(Some(Duration::from_secs(10))).unwrap();
    stalled.write_all(b"{\"action\":").unwrap();
    let mut out = String::new();
    stalled.read_to_string(&mut out).unwrap();
    let response: serde_json::Value = serde_json::from_str(out.trim_end()).unwrap();
    assert_eq!(response["status"], "error");
    assert_eq!(response["error"], "request timed out");
    assert!(started.elapsed() >= Duration::from_secs(1));

    assert!(client.is_running());
    client.send(&Request::Shutdown).unwrap();
    handle.join().unwrap().unwrap();
}

#[test]
fn second_daemon_refuses_a_live_socket() {
    let dir = tempfile::tempdir().unwrap();
    let config = Config::rooted_at(dir.path());
    let socket = config.daemon.socket_path.clone();
    let first = spawn_daemon(config.clone());
    let client = DaemonClient::new(&socket);
    wait_for(&client);

    let second = spawn_daemon(config);
    assert!(second.join().unwrap().is_err());
    assert!(client.is_running());

    client.send(&Request::Shutdown).unwrap();
    first.join().unwrap().unwrap();
}

#[test]
fn stale_socket_file_is_replaced() {
    let dir = tempfile::tempdir().unwrap();
    let config = Config::rooted_at(dir.path());
    let socket = config.daemon.socket_path.clone();
    {
        let _dead = std::os::unix::net::UnixListener::bind(&socket).unwrap();
    }
    assert!(socket.exists());

    let handle = spawn_daemon(config);
    let client = DaemonClient::new(&socket);
    wait_for(&client);
    client.send(&Request::Shutdown).unwrap();
    handle.join().unwrap().unwrap();
}

// SPDX-License-Identifier: Apache-2.0

//! End-to-end tests: real files and sockets flowing through an engine built
//! the way a worker builds one.

use std::path::Path;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;

use skidder::config::value;
use skidder::config::{AgentConfig, InputConfig, Settings};
use skidder::engine::watch::GlobWatcher;
use skidder::engine::Engine;
use skidder::inputs::file::FileTailer;
use skidder::inputs::socket::SocketListener;
use skidder::outputs;
use skidder::route::Router;

const POLL: Duration = Duration::from_millis(20);

fn fast_settings() -> Settings {
    Settings {
        poll: POLL,
        hostname: "itest".to_string(),
        ..Settings::default()
    }
}

/// Build an engine the way a group-0 worker does, from parsed config text.
fn build_engine(text: &str, settings: Settings) -> Engine {
    let config = AgentConfig::from_tree(&value::parse_str(text).unwrap()).unwrap();
    let sinks = outputs::build(&config.outputs).unwrap();
    let router = Router::build(&config.outputs);
    let watcher = GlobWatcher::new(settings.log_watch_interval);
    let mut engine = Engine::new(settings, sinks, router, watcher);

    for input in &config.inputs {
        match input {
            InputConfig::File(f) => {
                for path in &f.paths {
                    let tailer = FileTailer::new(f, Path::new(path), f.start_position);
                    engine.add_input(Box::new(tailer), &f.common, false);
                }
            }
            InputConfig::Socket(s) => {
                let listener = SocketListener::bind_std(s).unwrap();
                let input = SocketListener::spawn(s, listener, None).unwrap();
                engine.add_input(Box::new(input), &s.common, false);
            }
        }
    }
    engine
}

/// Accept one connection and collect `want` newline-terminated payloads.
async fn collect_lines(listener: TcpListener, want: usize) -> Vec<serde_json::Value> {
    let (stream, _) = listener.accept().await.unwrap();
    let mut reader = BufReader::new(stream);
    let mut collected = Vec::new();
    while collected.len() < want {
        let mut line = String::new();
        if reader.read_line(&mut line).await.unwrap() == 0 {
            break;
        }
        collected.push(serde_json::from_str(line.trim_end()).unwrap());
    }
    collected
}

fn messages(envelopes: &[serde_json::Value]) -> Vec<String> {
    envelopes
        .iter()
        .map(|v| v["@message"].as_str().unwrap().to_string())
        .collect()
}

async fn bind() -> (TcpListener, u16) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    (listener, port)
}

#[tokio::test]
async fn file_lines_reach_socket_output_in_order() {
    let dir = tempfile::tempdir().unwrap();
    let log = dir.path().join("app.log");
    std::fs::write(&log, "1\n2\n3\n").unwrap();

    let (listener, port) = bind().await;
    let server = tokio::spawn(collect_lines(listener, 3));

    let engine = build_engine(
        &format!(
            r#"
input {{ file {{ type app path {} start_position begin }} }}
output {{ socket {{ type app host 127.0.0.1 port {} }} }}
"#,
            log.display(),
            port
        ),
        fast_settings(),
    );

    let cancel = CancellationToken::new();
    let worker = tokio::spawn(engine.run(cancel.clone()));

    let envelopes = tokio::time::timeout(Duration::from_secs(5), server)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(messages(&envelopes), vec!["1", "2", "3"]);
    assert_eq!(envelopes[0]["@type"], "app");
    assert_eq!(envelopes[0]["@source_host"], "itest");

    cancel.cancel();
    let _ = worker.await;
}

#[tokio::test]
async fn rotation_emits_new_file_without_duplicates() {
    let dir = tempfile::tempdir().unwrap();
    let log = dir.path().join("a.log");
    std::fs::write(&log, "1\n2\n3\n").unwrap();

    let (listener, port) = bind().await;
    let server = tokio::spawn(collect_lines(listener, 5));

    let engine = build_engine(
        &format!(
            r#"
input {{ file {{ type rot path {} start_position begin }} }}
output {{ socket {{ type rot host 127.0.0.1 port {} }} }}
"#,
            log.display(),
            port
        ),
        fast_settings(),
    );

    let cancel = CancellationToken::new();
    let worker = tokio::spawn(engine.run(cancel.clone()));

    // let the first batch flow, then rotate
    tokio::time::sleep(Duration::from_millis(200)).await;
    std::fs::rename(&log, dir.path().join("a.log.1")).unwrap();
    std::fs::write(&log, "4\n5\n").unwrap();

    // within the grace window (20 EOF pulls at the poll interval) the new
    // file is picked up
    let envelopes = tokio::time::timeout(Duration::from_secs(10), server)
        .await
        .expect("rotation not picked up in time")
        .unwrap();
    assert_eq!(messages(&envelopes), vec!["1", "2", "3", "4", "5"]);

    cancel.cancel();
    let _ = worker.await;
}

#[tokio::test]
async fn broken_output_stashes_and_drains_while_healthy_output_flows() {
    let dir = tempfile::tempdir().unwrap();
    let log = dir.path().join("s.log");

    // r1 starts broken: bind to learn a free port, then drop it
    let (r1_listener, r1_port) = bind().await;
    drop(r1_listener);
    let (r2_listener, r2_port) = bind().await;
    let r2_server = tokio::spawn(collect_lines(r2_listener, 5));

    std::fs::write(&log, "1\n2\n3\n4\n5\n").unwrap();

    let engine = build_engine(
        &format!(
            r#"
input {{ file {{ type syslog path {} start_position begin }} }}
output {{
  socket {{ type syslog host 127.0.0.1 port {} timeout 1 }}
  socket {{ type syslog host 127.0.0.1 port {} timeout 1 }}
}}
"#,
            log.display(),
            r1_port,
            r2_port
        ),
        fast_settings(),
    );

    let cancel = CancellationToken::new();
    let worker = tokio::spawn(engine.run(cancel.clone()));

    // the healthy output receives the whole batch in order
    let envelopes = tokio::time::timeout(Duration::from_secs(5), r2_server)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(messages(&envelopes), vec!["1", "2", "3", "4", "5"]);

    // repair r1: its stash drains on a following tick
    let r1_listener = TcpListener::bind(("127.0.0.1", r1_port)).await.unwrap();
    let envelopes = tokio::time::timeout(Duration::from_secs(5), collect_lines(r1_listener, 5))
        .await
        .expect("stash did not drain after repair");
    assert_eq!(messages(&envelopes), vec!["1", "2", "3", "4", "5"]);

    cancel.cancel();
    let _ = worker.await;
}

#[tokio::test]
async fn wildcard_output_sees_every_type() {
    let dir = tempfile::tempdir().unwrap();
    let log_a = dir.path().join("a.log");
    let log_b = dir.path().join("b.log");
    std::fs::write(&log_a, "from-a\n").unwrap();
    std::fs::write(&log_b, "from-b\n").unwrap();

    let (listener, port) = bind().await;
    let server = tokio::spawn(collect_lines(listener, 2));

    let engine = build_engine(
        &format!(
            r#"
input {{
  file {{ type a path {} start_position begin }}
  file {{ type b path {} start_position begin }}
}}
output {{ socket {{ type * host 127.0.0.1 port {} }} }}
"#,
            log_a.display(),
            log_b.display(),
            port
        ),
        fast_settings(),
    );

    let cancel = CancellationToken::new();
    let worker = tokio::spawn(engine.run(cancel.clone()));

    let envelopes = tokio::time::timeout(Duration::from_secs(5), server)
        .await
        .unwrap()
        .unwrap();
    let mut types: Vec<&str> = envelopes
        .iter()
        .map(|v| v["@type"].as_str().unwrap())
        .collect();
    types.sort_unstable();
    assert_eq!(types, vec!["a", "b"]);

    cancel.cancel();
    let _ = worker.await;
}

#[tokio::test]
async fn socket_input_auth_gates_events() {
    let input_listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let input_port = input_listener.local_addr().unwrap().port();

    let (out_listener, out_port) = bind().await;
    let server = tokio::spawn(collect_lines(out_listener, 1));

    let config = AgentConfig::from_tree(
        &value::parse_str(&format!(
            r#"
input {{ socket {{ type net host 127.0.0.1 port {} auth secret }} }}
output {{ socket {{ type net host 127.0.0.1 port {} }} }}
"#,
            input_port, out_port
        ))
        .unwrap(),
    )
    .unwrap();

    let sinks = outputs::build(&config.outputs).unwrap();
    let router = Router::build(&config.outputs);
    let settings = fast_settings();
    let mut engine = Engine::new(
        settings.clone(),
        sinks,
        router,
        GlobWatcher::new(settings.log_watch_interval),
    );
    let InputConfig::Socket(s) = &config.inputs[0] else {
        panic!("expected socket input")
    };
    let input = SocketListener::spawn(s, input_listener, None).unwrap();
    engine.add_input(Box::new(input), &s.common, false);

    let cancel = CancellationToken::new();
    let worker = tokio::spawn(engine.run(cancel.clone()));

    // rejected client: replies 0 and produces nothing
    let mut bad = TcpStream::connect(("127.0.0.1", input_port)).await.unwrap();
    bad.write_all(b"wrong\nghost event\n").await.unwrap();
    let mut reply = String::new();
    let mut reader = BufReader::new(&mut bad);
    reader.read_line(&mut reply).await.unwrap();
    assert_eq!(reply, "0\n");

    // accepted client: replies 1 and the event flows through
    let mut good = TcpStream::connect(("127.0.0.1", input_port)).await.unwrap();
    good.write_all(b"secret\n").await.unwrap();
    let mut reader = BufReader::new(&mut good);
    let mut reply = String::new();
    reader.read_line(&mut reply).await.unwrap();
    assert_eq!(reply, "1\n");
    reader
        .get_mut()
        .write_all(b"real event\n")
        .await
        .unwrap();

    let envelopes = tokio::time::timeout(Duration::from_secs(5), server)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(messages(&envelopes), vec!["real event"]);

    cancel.cancel();
    let _ = worker.await;
}

#[tokio::test]
async fn derived_field_from_source_path() {
    let dir = tempfile::tempdir().unwrap();
    let vhost_dir = dir.path().join("foo.example").join("bar");
    std::fs::create_dir_all(&vhost_dir).unwrap();
    let log = vhost_dir.join("error.log");
    std::fs::write(&log, "oops\n").unwrap();

    let (listener, port) = bind().await;
    let server = tokio::spawn(collect_lines(listener, 1));

    let engine = build_engine(
        &format!(
            r#"
input {{
  file {{
    type apache
    path {}
    start_position begin
    field_match {{
      name domain
      field @source_path
      match ([a-z]+\.[a-z]+)/([a-z]+)/[^/]+$
      concat $2.$1
      default common
    }}
  }}
}}
output {{ socket {{ type apache host 127.0.0.1 port {} }} }}
"#,
            log.display(),
            port
        ),
        fast_settings(),
    );

    let cancel = CancellationToken::new();
    let worker = tokio::spawn(engine.run(cancel.clone()));

    let envelopes = tokio::time::timeout(Duration::from_secs(5), server)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(envelopes[0]["@fields"]["domain"], "bar.foo.example");

    cancel.cancel();
    let _ = worker.await;
}

#[tokio::test]
async fn glob_watch_enrolls_new_files_from_offset_zero() {
    let dir = tempfile::tempdir().unwrap();

    let (listener, port) = bind().await;
    let server = tokio::spawn(collect_lines(listener, 2));

    let mut settings = fast_settings();
    settings.log_watch_interval = Duration::from_millis(50);

    let config = AgentConfig::from_tree(
        &value::parse_str(&format!(
            r#"
input {{ file {{ type globbed path {}/*.log }} }}
output {{ socket {{ type globbed host 127.0.0.1 port {} }} }}
"#,
            dir.path().display(),
            port
        ))
        .unwrap(),
    )
    .unwrap();

    let sinks = outputs::build(&config.outputs).unwrap();
    let router = Router::build(&config.outputs);
    let mut watcher = GlobWatcher::new(settings.log_watch_interval);
    let InputConfig::File(f) = &config.inputs[0] else {
        panic!("expected file input")
    };
    watcher.add_watch(&f.paths[0], f);
    let engine = Engine::new(settings, sinks, router, watcher);

    let cancel = CancellationToken::new();
    let worker = tokio::spawn(engine.run(cancel.clone()));

    // file appears after startup; existing content is read from the start
    tokio::time::sleep(Duration::from_millis(100)).await;
    std::fs::write(dir.path().join("late.log"), "first\nsecond\n").unwrap();

    let envelopes = tokio::time::timeout(Duration::from_secs(5), server)
        .await
        .expect("glob discovery did not happen")
        .unwrap();
    assert_eq!(messages(&envelopes), vec!["first", "second"]);

    cancel.cancel();
    let _ = worker.await;
}

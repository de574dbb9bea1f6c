//! End-to-end ingestion over a bound Unix socket.

use std::fs;
use std::io::{Read, Write};
use std::os::unix::net::UnixStream;
use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use std::time::{Duration, Instant};

use telemd_core::config::CollectorConfig;
use telemd_core::{HeaderRegistry, RecordBuilder};
use telemd_daemon::protocol::bind_listener;
use telemd_daemon::{Collector, DaemonContext, ExitReason};
use tempfile::TempDir;

struct Harness {
    tmp: TempDir,
    socket: PathBuf,
    spool: PathBuf,
    collector: Collector,
    processed: Vec<PathBuf>,
    terminated: usize,
    rejected: usize,
}

impl Harness {
    fn new(override_id: Option<&str>, configure: impl FnOnce(&mut CollectorConfig)) -> Self {
        let tmp = TempDir::new().unwrap();
        let socket = tmp.path().join("run").join("telemd.sock");
        let spool = tmp.path().join("spool");

        let mut config = CollectorConfig::default();
        config.daemon.socket_path.clone_from(&socket);
        config.daemon.spool_dir.clone_from(&spool);
        config.identity.machine_id_file = tmp.path().join("machine_id");
        config.identity.override_file = tmp.path().join("override");
        if let Some(id) = override_id {
            fs::write(&config.identity.override_file, format!("{id}\n")).unwrap();
        }
        configure(&mut config);

        let registry = HeaderRegistry::new(["Machine-ID", "App"], "Machine-ID").unwrap();
        let ctx = DaemonContext::with_registry(config, registry);
        ctx.stager().ensure_spool_dir().unwrap();

        let listener = bind_listener(&socket).unwrap();
        let collector = Collector::new(ctx, listener).unwrap();

        Self {
            tmp,
            socket,
            spool,
            collector,
            processed: Vec::new(),
            terminated: 0,
            rejected: 0,
        }
    }

    fn connect(&self) -> UnixStream {
        UnixStream::connect(&self.socket).unwrap()
    }

    /// Run turns until `done` holds or two seconds pass.
    fn drive_until(&mut self, done: impl Fn(&Self) -> bool) {
        let deadline = Instant::now() + Duration::from_secs(2);
        while !done(self) {
            assert!(Instant::now() < deadline, "collector made no progress");
            let turn = self
                .collector
                .turn(Some(Duration::from_millis(50)))
                .unwrap();
            self.processed.extend(turn.processed);
            self.terminated += turn.terminated;
            self.rejected += turn.rejected;
        }
    }

    /// Run a few turns regardless of outcome.
    fn settle(&mut self) {
        for _ in 0..5 {
            let turn = self
                .collector
                .turn(Some(Duration::from_millis(20)))
                .unwrap();
            self.processed.extend(turn.processed);
            self.terminated += turn.terminated;
            self.rejected += turn.rejected;
        }
    }

    fn spool_files(&self) -> Vec<PathBuf> {
        let mut files: Vec<PathBuf> = fs::read_dir(&self.spool)
            .unwrap()
            .map(|e| e.unwrap().path())
            .collect();
        files.sort();
        files
    }

    fn persisted_id(&self) -> String {
        fs::read_to_string(self.tmp.path().join("machine_id"))
            .unwrap()
            .trim()
            .to_string()
    }
}

fn demo_record() -> Vec<u8> {
    RecordBuilder::new()
        .header("Machine-ID", "ignored-value")
        .header("App", "demo")
        .body("payload-data")
        .encode()
        .unwrap()
}

fn assert_closed_by_daemon(stream: &mut UnixStream) {
    stream
        .set_read_timeout(Some(Duration::from_secs(2)))
        .unwrap();
    let mut buf = [0u8; 1];
    assert_eq!(stream.read(&mut buf).unwrap(), 0);
}

#[test]
fn test_well_formed_record_is_staged_with_daemon_identity() {
    let mut harness = Harness::new(None, |_| {});
    let record = demo_record();
    assert_eq!(record.len(), 57);

    let mut client = harness.connect();
    client.write_all(&record).unwrap();
    harness.drive_until(|h| !h.processed.is_empty());

    let files = harness.spool_files();
    assert_eq!(files, harness.processed);
    assert_eq!(
        fs::read_to_string(&files[0]).unwrap(),
        format!(
            "Machine-ID: {}\nApp: demo\npayload-data\n",
            harness.persisted_id()
        )
    );
    assert_closed_by_daemon(&mut client);
    assert!(harness.collector.multiplexer().is_empty());
}

#[test]
fn test_config_tag_is_staged_first() {
    let mut harness = Harness::new(Some("static-id"), |_| {});
    let record = RecordBuilder::new()
        .config_path("/etc/telemetrics/custom.conf")
        .header("Machine-ID", "ignored-value")
        .header("App", "demo")
        .body("payload-data")
        .encode()
        .unwrap();

    harness.connect().write_all(&record).unwrap();
    harness.drive_until(|h| !h.processed.is_empty());

    assert_eq!(
        fs::read_to_string(&harness.processed[0]).unwrap(),
        "_cfg_file=/etc/telemetrics/custom.conf\nMachine-ID: static-id\nApp: demo\npayload-data\n"
    );
}

#[test]
fn test_latin1_header_value_is_staged_verbatim() {
    let mut harness = Harness::new(Some("static-id"), |_| {});
    let record = RecordBuilder::new()
        .header("Machine-ID", "ignored-value")
        .header("App", b"caf\xE9")
        .body("payload-data")
        .encode()
        .unwrap();

    harness.connect().write_all(&record).unwrap();
    harness.drive_until(|h| !h.processed.is_empty());

    assert_eq!(harness.terminated, 0);
    assert_eq!(
        fs::read(&harness.processed[0]).unwrap(),
        b"Machine-ID: static-id\nApp: caf\xE9\npayload-data\n"
    );
}

#[test]
fn test_override_precedence_over_persisted_identity() {
    let mut harness = Harness::new(Some("static-host-id"), |_| {});
    fs::write(harness.tmp.path().join("machine_id"), "persisted-id\n").unwrap();

    harness.connect().write_all(&demo_record()).unwrap();
    harness.drive_until(|h| !h.processed.is_empty());

    let staged = fs::read_to_string(&harness.processed[0]).unwrap();
    assert!(staged.starts_with("Machine-ID: static-host-id\n"));
    assert!(!staged.contains("persisted-id"));
}

#[test]
fn test_undersized_record_is_rejected() {
    let mut harness = Harness::new(None, |_| {});

    let mut client = harness.connect();
    client.write_all(&3u32.to_ne_bytes()).unwrap();
    harness.drive_until(|h| h.terminated == 1);

    assert_closed_by_daemon(&mut client);
    assert!(harness.spool_files().is_empty());
    assert!(harness.processed.is_empty());
}

#[test]
fn test_oversized_record_is_rejected() {
    let mut harness = Harness::new(None, |c| c.limits.max_payload_length = 16);
    let max = harness.collector.context().limits().max_record_size();

    let mut client = harness.connect();
    client
        .write_all(&u32::try_from(max + 1).unwrap().to_ne_bytes())
        .unwrap();
    harness.drive_until(|h| h.terminated == 1);

    assert_closed_by_daemon(&mut client);
    assert!(harness.spool_files().is_empty());
}

#[test]
fn test_partial_delivery_stages_nothing() {
    let mut harness = Harness::new(None, |_| {});
    let record = demo_record();

    let mut client = harness.connect();
    client.write_all(&record[..4]).unwrap();
    harness.settle();
    assert_eq!(harness.collector.multiplexer().len(), 1);

    client.write_all(&record[4..20]).unwrap();
    harness.settle();
    drop(client);

    harness.drive_until(|h| h.terminated == 1);
    assert!(harness.spool_files().is_empty());
    assert!(harness.collector.multiplexer().is_empty());
}

#[test]
fn test_split_prefix_and_body_resume() {
    let mut harness = Harness::new(None, |_| {});
    let record = demo_record();

    let mut client = harness.connect();
    for chunk in [&record[..1], &record[1..3], &record[3..5], &record[5..40], &record[40..]] {
        client.write_all(chunk).unwrap();
        harness.settle();
    }
    harness.drive_until(|h| !h.processed.is_empty());

    assert_eq!(harness.processed.len(), 1);
    assert_eq!(harness.terminated, 0);
}

#[test]
fn test_malformed_headers_stage_nothing() {
    let mut harness = Harness::new(None, |_| {});
    let record = RecordBuilder::new()
        .header("Machine-ID", "x")
        .header("Application", "demo")
        .body("payload-data")
        .encode()
        .unwrap();

    let mut client = harness.connect();
    client.write_all(&record).unwrap();
    harness.drive_until(|h| h.terminated == 1);

    assert_closed_by_daemon(&mut client);
    assert!(harness.spool_files().is_empty());
}

#[test]
fn test_clients_are_independent() {
    let mut harness = Harness::new(None, |_| {});
    let record = demo_record();

    let mut bad = harness.connect();
    let mut slow = harness.connect();
    let mut good = harness.connect();

    slow.write_all(&record[..10]).unwrap();
    bad.write_all(&0u32.to_ne_bytes()).unwrap();
    good.write_all(&record).unwrap();
    harness.drive_until(|h| h.processed.len() == 1 && h.terminated == 1);

    slow.write_all(&record[10..]).unwrap();
    harness.drive_until(|h| h.processed.len() == 2);

    assert_eq!(harness.spool_files().len(), 2);
}

#[test]
fn test_connection_cap_closes_excess_clients() {
    let mut harness = Harness::new(None, |c| c.daemon.max_connections = 1);

    let _first = harness.connect();
    let mut second = harness.connect();
    harness.drive_until(|h| h.rejected == 1);

    assert_closed_by_daemon(&mut second);
    assert_eq!(harness.collector.multiplexer().len(), 1);
}

#[test]
fn test_idle_clients_are_reaped_on_tick() {
    let mut harness = Harness::new(None, |c| c.daemon.client_timeout_secs = 1);

    let mut client = harness.connect();
    client.write_all(&demo_record()[..6]).unwrap();
    harness.drive_until(|h| h.collector.multiplexer().len() == 1);
    harness.settle();

    harness.collector.tick(Instant::now() + Duration::from_secs(5));

    assert!(harness.collector.multiplexer().is_empty());
    assert_closed_by_daemon(&mut client);
    assert!(harness.spool_files().is_empty());
}

#[test]
fn test_tick_generates_machine_id() {
    let mut harness = Harness::new(None, |_| {});
    assert!(!harness.tmp.path().join("machine_id").exists());

    harness.collector.tick(Instant::now());

    let id = harness.persisted_id();
    assert_eq!(id.len(), 32);
    assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
}

#[test]
fn test_run_stops_on_shutdown_flag() {
    let mut harness = Harness::new(None, |_| {});
    let shutdown = AtomicBool::new(true);

    assert_eq!(
        harness.collector.run(&shutdown).unwrap(),
        ExitReason::Shutdown
    );
}

#[test]
fn test_run_exits_when_idle() {
    let mut harness = Harness::new(None, |c| {
        c.daemon.idle_exit_secs = 1;
        c.daemon.tick_interval_secs = 1;
    });
    let shutdown = AtomicBool::new(false);

    let started = Instant::now();
    assert_eq!(harness.collector.run(&shutdown).unwrap(), ExitReason::Idle);
    assert!(started.elapsed() >= Duration::from_secs(1));
}

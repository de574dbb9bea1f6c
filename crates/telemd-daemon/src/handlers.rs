//! Record handler: decode, stamp the machine identity, stage.

use std::path::PathBuf;

use telemd_core::decode;
use tracing::{debug, error, info};

use crate::protocol::error::TerminationReason;
use crate::state::DaemonContext;

/// Decode a fully received record, rewrite its identity header and stage it.
///
/// `record` is everything after the 4-byte size prefix. The persisted
/// identity is refreshed before the record is decoded; a failure to do so is
/// logged and the current identity (or the placeholder) is used.
///
/// # Errors
///
/// Returns [`TerminationReason::Decode`] for a malformed record and
/// [`TerminationReason::Staging`] if the spool write fails. Nothing is staged
/// in either case.
pub fn decode_and_stage(ctx: &DaemonContext, record: &[u8]) -> Result<PathBuf, TerminationReason> {
    if let Err(e) = ctx.identity().maintain() {
        error!(error = %e, "Failed to refresh machine id");
    }

    let mut decoded = decode(record, ctx.registry()).map_err(|e| {
        info!(size = record.len(), error = %e, "Discarding malformed record");
        TerminationReason::Decode(e)
    })?;

    let machine_id = ctx.identity().current();
    decoded.headers.rewrite_identity(&machine_id);

    let path = ctx.stager().stage(&decoded).map_err(|e| {
        error!(error = %e, "Failed to stage record");
        TerminationReason::Staging(e)
    })?;

    debug!(
        path = %path.display(),
        config = decoded.config_path.is_some(),
        body_len = decoded.body.len(),
        "Staged record"
    );
    Ok(path)
}

#[cfg(test)]
mod tests {
    use std::fs;

    use telemd_core::config::CollectorConfig;
    use telemd_core::{DecodeError, HeaderRegistry, MachineIdentity, RecordBuilder};
    use tempfile::TempDir;

    use super::*;

    struct Fixture {
        tmp: TempDir,
        ctx: DaemonContext,
    }

    impl Fixture {
        fn new(override_id: Option<&str>) -> Self {
            let tmp = TempDir::new().unwrap();
            let spool = tmp.path().join("spool");
            fs::create_dir(&spool).unwrap();

            let mut config = CollectorConfig::default();
            config.daemon.spool_dir = spool;
            config.identity.machine_id_file = tmp.path().join("machine_id");
            config.identity.override_file = tmp.path().join("override");
            if let Some(id) = override_id {
                fs::write(&config.identity.override_file, format!("{id}\n")).unwrap();
            }

            let registry = HeaderRegistry::new(["Machine-ID", "App"], "Machine-ID").unwrap();
            let ctx = DaemonContext::with_registry(config, registry);
            Self { tmp, ctx }
        }

        fn spool_files(&self) -> Vec<PathBuf> {
            fs::read_dir(self.tmp.path().join("spool"))
                .unwrap()
                .map(|e| e.unwrap().path())
                .collect()
        }
    }

    fn demo_record() -> Vec<u8> {
        let bytes = RecordBuilder::new()
            .header("Machine-ID", "ignored-value")
            .header("App", "demo")
            .body("payload-data")
            .encode()
            .unwrap();
        bytes[4..].to_vec()
    }

    #[test]
    fn test_identity_is_rewritten_with_persisted_id() {
        let fixture = Fixture::new(None);

        let path = decode_and_stage(&fixture.ctx, &demo_record()).unwrap();
        let machine_id = fixture.ctx.identity().current();

        assert_eq!(machine_id.len(), 32);
        assert_eq!(
            fs::read_to_string(path).unwrap(),
            format!("Machine-ID: {machine_id}\nApp: demo\npayload-data\n")
        );
    }

    #[test]
    fn test_override_takes_precedence() {
        let fixture = Fixture::new(Some("static-host-id"));
        fs::write(fixture.tmp.path().join("machine_id"), "persisted-id\n").unwrap();

        let path = decode_and_stage(&fixture.ctx, &demo_record()).unwrap();

        assert_eq!(
            fs::read_to_string(path).unwrap(),
            "Machine-ID: static-host-id\nApp: demo\npayload-data\n"
        );
    }

    #[test]
    fn test_same_record_stages_identically() {
        let fixture = Fixture::new(None);

        let first = decode_and_stage(&fixture.ctx, &demo_record()).unwrap();
        let second = decode_and_stage(&fixture.ctx, &demo_record()).unwrap();

        assert_ne!(first, second);
        assert_eq!(fs::read(first).unwrap(), fs::read(second).unwrap());
    }

    #[test]
    fn test_malformed_record_stages_nothing() {
        let fixture = Fixture::new(None);
        let bytes = RecordBuilder::new()
            .header("Machine-ID", "x")
            .body("no app header")
            .encode()
            .unwrap();

        let err = decode_and_stage(&fixture.ctx, &bytes[4..]).unwrap_err();
        assert!(matches!(
            err,
            TerminationReason::Decode(DecodeError::HeaderCount {
                expected: 2,
                found: 1
            })
        ));
        assert!(fixture.spool_files().is_empty());
    }

    #[test]
    fn test_missing_spool_is_a_staging_error() {
        let fixture = Fixture::new(None);
        fs::remove_dir(fixture.tmp.path().join("spool")).unwrap();

        assert!(matches!(
            decode_and_stage(&fixture.ctx, &demo_record()),
            Err(TerminationReason::Staging(_))
        ));
    }

    #[test]
    fn test_placeholder_when_identity_unwritable() {
        let tmp = TempDir::new().unwrap();
        let spool = tmp.path().join("spool");
        fs::create_dir(&spool).unwrap();

        let mut config = CollectorConfig::default();
        config.daemon.spool_dir = spool;
        let registry = HeaderRegistry::new(["Machine-ID", "App"], "Machine-ID").unwrap();
        // The identity file's parent is a regular file, so it can be neither
        // read nor created.
        let blocker = tmp.path().join("blocker");
        fs::write(&blocker, "").unwrap();
        let identity = MachineIdentity::new(blocker.join("machine_id"), config.identity.expiry());
        let ctx = DaemonContext::from_parts(config, registry, identity);

        let path = decode_and_stage(&ctx, &demo_record()).unwrap();
        assert_eq!(
            fs::read_to_string(path).unwrap(),
            "Machine-ID: 0\nApp: demo\npayload-data\n"
        );
    }
}

//! Writer configuration, applied from the metaserver's flat property map.

use std::path::PathBuf;
use std::time::Duration;

use crate::replica::LogTransmitter;
use crate::service::{AppResult, Properties};

#[derive(Debug, Clone)]
pub(super) struct WriterParams {
    /// Skip default-valued fields when serializing records.
    pub(super) omit_defaults: bool,
    /// Records per block upper bound.
    pub(super) max_block_size: i64,
    pub(super) log_dir: PathBuf,
    pub(super) last_log_name: String,
    pub(super) rotate_interval: Duration,
    pub(super) panic_on_io_error: bool,
    /// Fsync every block.
    pub(super) sync: bool,
    /// When positive, roughly one batch in N fails on purpose.
    pub(super) failure_simulation_interval: i64,
}

impl Default for WriterParams {
    fn default() -> Self {
        Self {
            omit_defaults: true,
            max_block_size: 256,
            log_dir: PathBuf::from("./kfslog"),
            last_log_name: "last".to_string(),
            rotate_interval: Duration::from_secs(600),
            panic_on_io_error: false,
            sync: false,
            failure_simulation_interval: 0,
        }
    }
}

impl WriterParams {
    /// Applies the `<prefix>key` settings, forwarding `<prefix>transmitter.*`
    /// to the transmitter; a transmitter rejection aborts the update.
    pub(super) fn apply(
        &mut self,
        prefix: &str,
        params: &Properties,
        transmitter: &mut dyn LogTransmitter,
    ) -> AppResult<()> {
        let key = |name: &str| format!("{prefix}{name}");
        self.omit_defaults = params.get_bool(&key("omitDefaults"), self.omit_defaults);
        self.max_block_size = params.get_i64(&key("maxBlockSize"), self.max_block_size);
        if let Some(dir) = params.get(&key("logDir")) {
            self.log_dir = PathBuf::from(dir);
        }
        if let Some(name) = params.get(&key("lastLogName")) {
            self.last_log_name = name.to_string();
        }
        let rotate_sec = params.get_f64(
            &key("rotateIntervalSec"),
            self.rotate_interval.as_secs_f64(),
        );
        self.rotate_interval = Duration::from_secs_f64(rotate_sec.max(0.0));
        self.panic_on_io_error = params.get_bool(&key("panicOnIoError"), self.panic_on_io_error);
        self.sync = params.get_bool(&key("sync"), self.sync);
        self.failure_simulation_interval = params.get_i64(
            &key("failureSimulationInterval"),
            self.failure_simulation_interval,
        );
        transmitter.set_parameters(&key("transmitter."), params)
    }

    pub(super) fn last_log_path(&self) -> PathBuf {
        self.log_dir.join(&self.last_log_name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::log::Seq;
    use crate::service::AppError;

    struct RecordingTransmitter {
        prefix: Option<String>,
        fail: bool,
    }

    impl LogTransmitter for RecordingTransmitter {
        fn set_parameters(&mut self, prefix: &str, _params: &Properties) -> AppResult<()> {
            self.prefix = Some(prefix.to_string());
            if self.fail {
                return Err(AppError::TransmitterConfig("no channels".into()));
            }
            Ok(())
        }

        fn is_up(&self) -> bool {
            true
        }

        fn transmit_block(
            &mut self,
            _end_seq: Seq,
            _record_count: i32,
            _block: &[u8],
            _checksum: u32,
            _checksum_len: usize,
        ) -> i32 {
            0
        }
    }

    #[test]
    fn apply_reads_prefixed_keys_and_forwards_transmitter_prefix() {
        let mut props = Properties::new();
        props.set("meta.log.maxBlockSize", "64");
        props.set("meta.log.logDir", "/var/meta/txlog");
        props.set("meta.log.lastLogName", "latest");
        props.set("meta.log.rotateIntervalSec", "1.5");
        props.set("meta.log.sync", "1");
        props.set("meta.log.failureSimulationInterval", "17");

        let mut params = WriterParams::default();
        let mut transmitter = RecordingTransmitter {
            prefix: None,
            fail: false,
        };
        params
            .apply("meta.log.", &props, &mut transmitter)
            .expect("apply");

        assert_eq!(params.max_block_size, 64);
        assert_eq!(params.log_dir, PathBuf::from("/var/meta/txlog"));
        assert_eq!(params.last_log_name, "latest");
        assert_eq!(params.rotate_interval, Duration::from_secs_f64(1.5));
        assert!(params.sync);
        assert!(params.omit_defaults);
        assert_eq!(params.failure_simulation_interval, 17);
        assert_eq!(
            params.last_log_path(),
            PathBuf::from("/var/meta/txlog/latest")
        );
        assert_eq!(
            transmitter.prefix.as_deref(),
            Some("meta.log.transmitter.")
        );
    }

    #[test]
    fn transmitter_rejection_aborts_the_update() {
        let mut params = WriterParams::default();
        let mut transmitter = RecordingTransmitter {
            prefix: None,
            fail: true,
        };
        assert!(params
            .apply("meta.log.", &Properties::new(), &mut transmitter)
            .is_err());
    }
}

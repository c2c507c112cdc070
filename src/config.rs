use crate::error::ConfigError;
use std::{
    fs,
    ops::Index,
    path::{Path, PathBuf},
    time::Duration,
};
use yaml_rust::{Yaml, YamlLoader};

/// Highest accepted device id.
pub const MAX_DEVICE_ID: u32 = 15;
/// Maximum number of scheduler threads.
pub const MAX_AICPU_THREADS: usize = 4;
/// Maximum number of workers a single scheduler thread polls.
pub const MAX_CORES_PER_THREAD: usize = 72;

pub const DEFAULT_RENDEZVOUS_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_RUN_TIMEOUT: Duration = Duration::from_secs(60);

// Keys of the YAML configuration file. Every key is optional.
mod keys {
    pub const SECTION_NAME: &str = "aicpu_sched";
    pub const DEVICE_ID: &str = "device_id";
    pub const AIC_NUM: &str = "aic_num";
    pub const AIV_NUM: &str = "aiv_num";
    pub const THREAD_NUM: &str = "thread_num";
    pub const AICPU_BINARY: &str = "aicpu_binary";
    pub const AICORE_BINARY: &str = "aicore_binary";
    pub const RENDEZVOUS_TIMEOUT_MS: &str = "rendezvous_timeout_ms";
    pub const RUN_TIMEOUT_MS: &str = "run_timeout_ms";
    pub const PROFILING: &str = "profiling";
}

/// Runtime parameters of a scheduler run.
///
/// A timeout of `None` waits forever.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeConfig {
    pub device_id: u32,
    pub aic_num: usize,
    pub aiv_num: usize,
    pub thread_num: usize,
    pub aicpu_binary: Option<PathBuf>,
    pub aicore_binary: Option<PathBuf>,
    pub rendezvous_timeout: Option<Duration>,
    pub run_timeout: Option<Duration>,
    pub profiling: bool,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            device_id: 0,
            aic_num: 1,
            aiv_num: 2,
            thread_num: 1,
            aicpu_binary: None,
            aicore_binary: None,
            rendezvous_timeout: Some(DEFAULT_RENDEZVOUS_TIMEOUT),
            run_timeout: Some(DEFAULT_RUN_TIMEOUT),
            profiling: false,
        }
    }
}

impl RuntimeConfig {
    pub fn builder() -> RuntimeConfigBuilder {
        RuntimeConfigBuilder::default()
    }

    /// Builder starting from this configuration, for applying overrides.
    pub fn into_builder(self) -> RuntimeConfigBuilder {
        RuntimeConfigBuilder { config: self }
    }

    /// Reads and validates a YAML configuration file.
    ///
    /// # Errors
    /// `Io` when the file cannot be read, otherwise as
    /// [`from_yaml_str`](Self::from_yaml_str).
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).map_err(|err| ConfigError::Io(format!("{}: {err}", path.display())))?;
        Self::from_yaml_str(&text)
    }

    /// Parses and validates a configuration document.
    ///
    /// Keys live under an `aicpu_sched` mapping; absent keys keep their
    /// defaults, and a null timeout disables it.
    ///
    /// # Errors
    /// `Yaml` for malformed documents, `InvalidValue` for mistyped keys, and
    /// any error of [`validate`](Self::validate).
    pub fn from_yaml_str(text: &str) -> Result<Self, ConfigError> {
        let docs = YamlLoader::load_from_str(text).map_err(|err| ConfigError::Yaml(err.to_string()))?;
        let doc = match &docs[..] {
            [doc] => doc,
            _ => return Err(ConfigError::Yaml("expected exactly one document".to_owned())),
        };
        let section = match doc.index(keys::SECTION_NAME) {
            Yaml::Hash(_) => doc.index(keys::SECTION_NAME),
            Yaml::BadValue => return Err(ConfigError::Yaml(format!("missing section `{}`", keys::SECTION_NAME))),
            _ => {
                return Err(ConfigError::Yaml(format!(
                    "section `{}` is not a mapping",
                    keys::SECTION_NAME
                )));
            }
        };

        let mut builder = Self::builder();
        if let Some(device_id) = get_int_option(section, keys::DEVICE_ID)? {
            builder = builder.device_id(device_id);
        }
        if let Some(aic_num) = get_int_option(section, keys::AIC_NUM)? {
            builder = builder.aic_num(aic_num);
        }
        if let Some(aiv_num) = get_int_option(section, keys::AIV_NUM)? {
            builder = builder.aiv_num(aiv_num);
        }
        if let Some(thread_num) = get_int_option(section, keys::THREAD_NUM)? {
            builder = builder.thread_num(thread_num);
        }
        if let Some(path) = get_str_option(section, keys::AICPU_BINARY)? {
            builder = builder.aicpu_binary(path);
        }
        if let Some(path) = get_str_option(section, keys::AICORE_BINARY)? {
            builder = builder.aicore_binary(path);
        }
        if let Some(timeout) = get_timeout_option(section, keys::RENDEZVOUS_TIMEOUT_MS)? {
            builder = builder.rendezvous_timeout(timeout);
        }
        if let Some(timeout) = get_timeout_option(section, keys::RUN_TIMEOUT_MS)? {
            builder = builder.run_timeout(timeout);
        }
        match section.index(keys::PROFILING) {
            Yaml::BadValue => {}
            value => {
                let enable = value.as_bool().ok_or_else(|| invalid(keys::PROFILING, "expected a boolean"))?;
                builder = builder.profiling(enable);
            }
        }
        builder.build()
    }

    /// Checks every limit of the runtime.
    ///
    /// # Errors
    /// `InvalidDeviceId`, `InvalidThreadNum`, `NoCores`,
    /// `CoresPerThreadExceeded`, or `MissingBinary` for a configured binary
    /// that does not exist.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.device_id > MAX_DEVICE_ID {
            return Err(ConfigError::InvalidDeviceId(self.device_id));
        }
        CoreAssignment::new(self.aic_num, self.aiv_num, self.thread_num)?;
        for binary in [&self.aicpu_binary, &self.aicore_binary].into_iter().flatten() {
            if !binary.exists() {
                return Err(ConfigError::MissingBinary(binary.clone()));
            }
        }
        Ok(())
    }

    #[must_use]
    pub fn core_num(&self) -> usize {
        self.aic_num + self.aiv_num
    }

    /// Partition of the workers among scheduler threads.
    ///
    /// # Errors
    /// As [`CoreAssignment::new`].
    pub fn core_assignment(&self) -> Result<CoreAssignment, ConfigError> {
        CoreAssignment::new(self.aic_num, self.aiv_num, self.thread_num)
    }
}

fn invalid(key: &'static str, reason: &str) -> ConfigError {
    ConfigError::InvalidValue {
        key,
        reason: reason.to_owned(),
    }
}

fn get_int_option<T: TryFrom<i64>>(section: &Yaml, key: &'static str) -> Result<Option<T>, ConfigError> {
    match section.index(key) {
        Yaml::BadValue => Ok(None),
        value => {
            let raw = value.as_i64().ok_or_else(|| invalid(key, "expected an integer"))?;
            T::try_from(raw).map(Some).map_err(|_| invalid(key, "out of range"))
        }
    }
}

fn get_str_option<'a>(section: &'a Yaml, key: &'static str) -> Result<Option<&'a str>, ConfigError> {
    match section.index(key) {
        Yaml::BadValue => Ok(None),
        value => value.as_str().map(Some).ok_or_else(|| invalid(key, "expected a string")),
    }
}

/// `Some(None)` for an explicit null.
fn get_timeout_option(section: &Yaml, key: &'static str) -> Result<Option<Option<Duration>>, ConfigError> {
    match section.index(key) {
        Yaml::Null => Ok(Some(None)),
        _ => Ok(get_int_option::<u64>(section, key)?.map(|ms| Some(Duration::from_millis(ms)))),
    }
}

/// Builds a validated [`RuntimeConfig`], starting from the defaults.
#[must_use]
#[derive(Debug, Clone, Default)]
pub struct RuntimeConfigBuilder {
    config: RuntimeConfig,
}

impl RuntimeConfigBuilder {
    pub fn device_id(mut self, device_id: u32) -> Self {
        self.config.device_id = device_id;
        self
    }

    pub fn aic_num(mut self, aic_num: usize) -> Self {
        self.config.aic_num = aic_num;
        self
    }

    pub fn aiv_num(mut self, aiv_num: usize) -> Self {
        self.config.aiv_num = aiv_num;
        self
    }

    pub fn thread_num(mut self, thread_num: usize) -> Self {
        self.config.thread_num = thread_num;
        self
    }

    pub fn aicpu_binary(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.aicpu_binary = Some(path.into());
        self
    }

    pub fn aicore_binary(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.aicore_binary = Some(path.into());
        self
    }

    pub fn rendezvous_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.config.rendezvous_timeout = timeout;
        self
    }

    pub fn run_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.config.run_timeout = timeout;
        self
    }

    pub fn profiling(mut self, enable: bool) -> Self {
        self.config.profiling = enable;
        self
    }

    /// # Errors
    /// As [`RuntimeConfig::validate`].
    pub fn build(self) -> Result<RuntimeConfig, ConfigError> {
        self.config.validate()?;
        Ok(self.config)
    }
}

/// Static partition of the workers among scheduler threads.
///
/// Channels are laid out cube first: cube cores are `0..aic_num` and vector
/// cores `aic_num..aic_num + aiv_num`. Thread `t` of `T` owns cube cores
/// `t, t + T, ...` and, likewise, every `T`-th vector core starting at
/// `aic_num + t`. Every core is owned by exactly one thread.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct CoreAssignment {
    aic_num: usize,
    aiv_num: usize,
    thread_num: usize,
}

impl CoreAssignment {
    /// # Errors
    /// `InvalidThreadNum` outside `1..=MAX_AICPU_THREADS`, `NoCores` without
    /// workers, `CoresPerThreadExceeded` when a thread would own more than
    /// [`MAX_CORES_PER_THREAD`] cores.
    pub fn new(aic_num: usize, aiv_num: usize, thread_num: usize) -> Result<Self, ConfigError> {
        if thread_num == 0 || thread_num > MAX_AICPU_THREADS {
            return Err(ConfigError::InvalidThreadNum(thread_num));
        }
        if aic_num + aiv_num == 0 {
            return Err(ConfigError::NoCores);
        }
        let busiest = aic_num.div_ceil(thread_num) + aiv_num.div_ceil(thread_num);
        if busiest > MAX_CORES_PER_THREAD {
            return Err(ConfigError::CoresPerThreadExceeded {
                cores: busiest,
                max: MAX_CORES_PER_THREAD,
            });
        }
        Ok(Self {
            aic_num,
            aiv_num,
            thread_num,
        })
    }

    #[must_use]
    pub fn thread_num(&self) -> usize {
        self.thread_num
    }

    #[must_use]
    pub fn core_num(&self) -> usize {
        self.aic_num + self.aiv_num
    }

    #[must_use]
    pub fn aic_num(&self) -> usize {
        self.aic_num
    }

    #[must_use]
    pub fn aiv_num(&self) -> usize {
        self.aiv_num
    }

    /// Cores owned by `thread_idx`: its cube cores, then its vector cores.
    /// Empty for an out-of-range thread.
    #[must_use]
    pub fn cores(&self, thread_idx: usize) -> Vec<usize> {
        if thread_idx >= self.thread_num {
            return Vec::new();
        }
        let cube = (thread_idx..self.aic_num).step_by(self.thread_num);
        let vector = (self.aic_num + thread_idx..self.core_num()).step_by(self.thread_num);
        cube.chain(vector).collect()
    }
}

//! The configuration loader (A1) reads the handful of environment
//! variables documented in the external interface section once, at
//! first-use initialization, and turns them into a validated,
//! immutable snapshot. A malformed environment is reported through
//! `ConfigError` rather than a panic: the dispatcher latches that into
//! `Status::Failed` and falls back to pure forwarding for the rest of
//! the process's life.
use std::path::PathBuf;
use std::time::Duration;

const ENV_HEAP_SIZE: &str = "ENV_MMAP_HEAP_SIZE";
const ENV_MIN_BSIZE: &str = "ENV_MMAP_ALLOCATOR_MIN_BSIZE";
const ENV_NAMING_TEMPLATE: &str = "ENV_NAMING_TEMPLATE";
const ENV_PROFILE_FILE_PATH: &str = "ENV_PROFILE_FILE_PATH";
const ENV_PROFILE_FREQUENCY: &str = "ENV_PROFILE_FREQUENCY";

#[cfg(not(feature = "test_only_small_region"))]
const DEFAULT_HEAP_SIZE: u64 = 4 * (1u64 << 40); // 4 TiB
#[cfg(not(feature = "test_only_small_region"))]
const DEFAULT_MIN_BSIZE: u64 = 2 * (1u64 << 30); // 2 GiB

// The real defaults reserve multiple terabytes of address space, which
// is wasteful to repeat across every integration test process. This
// feature shrinks both defaults to a few dozen pages.
#[cfg(feature = "test_only_small_region")]
const DEFAULT_HEAP_SIZE: u64 = 256 * 4096;
#[cfg(feature = "test_only_small_region")]
const DEFAULT_MIN_BSIZE: u64 = 4096;

const DEFAULT_NAMING_TEMPLATE: &str = ".mmap_alloc.XXXXXXXXXX";
const DEFAULT_PROFILE_FREQUENCY: Duration = Duration::from_secs(1);

/// Fixed cap on the naming template's length, matching the source
/// implementation's buffer budget.
const MAX_TEMPLATE_LEN: usize = 64;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{0} is not a valid unsigned integer: {1}")]
    NotAnInteger(&'static str, String),
    #[error("{ENV_HEAP_SIZE} ({0}) must be a positive multiple of the page size ({1})")]
    HeapSizeNotPageAligned(u64, usize),
    #[error("{ENV_MIN_BSIZE} ({0}) must not exceed {ENV_HEAP_SIZE} ({1})")]
    ThresholdExceedsCapacity(u64, u64),
    #[error("{ENV_NAMING_TEMPLATE} is longer than the {MAX_TEMPLATE_LEN}-byte limit")]
    TemplateTooLong,
    #[error("{ENV_NAMING_TEMPLATE} must end in a run of at least six 'X' characters")]
    TemplateMissingPlaceholder,
    #[error("{ENV_PROFILE_FREQUENCY} must be a positive number of milliseconds")]
    NonPositiveProfileFrequency,
    #[error("{ENV_PROFILE_FILE_PATH} ({0:?}) could not be opened for appending: {1}")]
    ProfileFileUnopenable(PathBuf, std::io::Error),
}

/// Read-only snapshot of the allocator's configuration, captured once
/// at initialization. Never mutated afterward.
#[derive(Debug, Clone)]
pub struct Config {
    pub heap_size: usize,
    pub min_bsize: usize,
    pub naming_template: String,
    pub profile_path: Option<PathBuf>,
    pub profile_frequency: Duration,
}

fn read_u64(name: &'static str, default: u64) -> Result<u64, ConfigError> {
    match std::env::var(name) {
        Err(_) => Ok(default),
        Ok(value) => value
            .trim()
            .parse::<u64>()
            .map_err(|_| ConfigError::NotAnInteger(name, value)),
    }
}

/// Loads and validates configuration from the process environment.
///
/// # Errors
///
/// Returns `ConfigError` if any variable is malformed or out of range;
/// see §6 and §7 (`CONFIG_INVALID`) for the exact constraints.
pub fn load() -> Result<Config, ConfigError> {
    let page_size = crate::region::page_size();

    let heap_size = read_u64(ENV_HEAP_SIZE, DEFAULT_HEAP_SIZE)?;
    if heap_size == 0 || heap_size % page_size as u64 != 0 {
        return Err(ConfigError::HeapSizeNotPageAligned(heap_size, page_size));
    }

    let min_bsize = read_u64(ENV_MIN_BSIZE, DEFAULT_MIN_BSIZE)?;
    if min_bsize > heap_size {
        return Err(ConfigError::ThresholdExceedsCapacity(
            min_bsize, heap_size,
        ));
    }

    let naming_template =
        std::env::var(ENV_NAMING_TEMPLATE).unwrap_or_else(|_| DEFAULT_NAMING_TEMPLATE.to_string());
    if naming_template.len() > MAX_TEMPLATE_LEN {
        return Err(ConfigError::TemplateTooLong);
    }
    validate_template_placeholder(&naming_template)?;

    let profile_path = std::env::var_os(ENV_PROFILE_FILE_PATH).map(PathBuf::from);
    if let Some(path) = &profile_path {
        // Fail fast at config time rather than silently losing every
        // sample later: open (and immediately drop) the file the same
        // way the profiler thread will, to catch a bad path early.
        std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|e| ConfigError::ProfileFileUnopenable(path.clone(), e))?;
    }

    let profile_frequency = match std::env::var(ENV_PROFILE_FREQUENCY) {
        Err(_) => DEFAULT_PROFILE_FREQUENCY,
        Ok(value) => {
            let millis = value
                .trim()
                .parse::<u64>()
                .map_err(|_| ConfigError::NotAnInteger(ENV_PROFILE_FREQUENCY, value.clone()))?;
            if millis == 0 {
                return Err(ConfigError::NonPositiveProfileFrequency);
            }
            Duration::from_millis(millis)
        }
    };

    Ok(Config {
        heap_size: heap_size as usize,
        min_bsize: min_bsize as usize,
        naming_template,
        profile_path,
        profile_frequency,
    })
}

fn validate_template_placeholder(template: &str) -> Result<(), ConfigError> {
    let run = template
        .chars()
        .rev()
        .take_while(|&c| c == 'X')
        .count();

    if run < 6 {
        Err(ConfigError::TemplateMissingPlaceholder)
    } else {
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn validate_template_placeholder_rejects_short_runs() {
        assert!(validate_template_placeholder("a.XXXXXXXXXX").is_ok());
        assert!(validate_template_placeholder("a.XXXXX").is_err());
        assert!(validate_template_placeholder("no-placeholder").is_err());
    }

    #[test]
    fn defaults_are_internally_consistent() {
        assert!(DEFAULT_MIN_BSIZE <= DEFAULT_HEAP_SIZE);
        assert_eq!(DEFAULT_HEAP_SIZE % 4096, 0);
        assert!(DEFAULT_NAMING_TEMPLATE.len() <= MAX_TEMPLATE_LEN);
        validate_template_placeholder(DEFAULT_NAMING_TEMPLATE).unwrap();
    }

    #[test]
    fn read_u64_falls_back_to_default_when_unset() {
        std::env::remove_var("ENV_MMAP_ALLOC_CONFIG_TEST_UNSET");
        assert_eq!(
            read_u64("ENV_MMAP_ALLOC_CONFIG_TEST_UNSET", 42).unwrap(),
            42
        );
    }
}

//! Container configuration
//!
//! [`ContainerOptions`] is an immutable snapshot built through
//! [`ContainerOptionsBuilder`]. A container reads it once in `start()`, so
//! replacing options only takes effect after a restart.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::acknowledgement::{AcknowledgementMode, AcknowledgementOrdering};
use crate::backpressure::{BackPressureHandlerFactory, BackPressureLimiter};
use crate::source::BackOffPolicy;

/// How the default backpressure chain is assembled
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackPressureMode {
    /// Switch between low and high throughput based on poll results
    #[default]
    Auto,
    /// Like `Auto`, but only poll when a full batch of permits is available
    AlwaysPollMaxMessages,
    /// Always poll in parallel, bounded only by `max_concurrent_messages`
    FixedHighThroughput,
}

impl std::str::FromStr for BackPressureMode {
    type Err = ContainerOptionsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "auto" | "" => Ok(BackPressureMode::Auto),
            "always_poll_max_messages" | "always-poll-max-messages" => {
                Ok(BackPressureMode::AlwaysPollMaxMessages)
            }
            "fixed_high_throughput" | "fixed-high-throughput" => {
                Ok(BackPressureMode::FixedHighThroughput)
            }
            _ => Err(ContainerOptionsError::Parse {
                name: "back_pressure_mode",
                value: s.to_string(),
            }),
        }
    }
}

/// Whether listeners receive one message or a whole batch
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ListenerMode {
    /// One pipeline invocation per message
    #[default]
    SingleMessage,
    /// One pipeline invocation per polled batch
    Batch,
}

impl std::str::FromStr for ListenerMode {
    type Err = ContainerOptionsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "single_message" | "single-message" | "single" | "" => Ok(ListenerMode::SingleMessage),
            "batch" => Ok(ListenerMode::Batch),
            _ => Err(ContainerOptionsError::Parse {
                name: "listener_mode",
                value: s.to_string(),
            }),
        }
    }
}

/// How FIFO batches are split across message groups
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FifoBatchGroupingStrategy {
    /// Each message group is processed as its own batch, groups in parallel
    #[default]
    ProcessMessageGroupsInParallelBatches,
    /// A polled batch is processed as a whole, mixing groups
    ProcessMultipleGroupsInSameBatch,
}

/// Options validation and parsing errors
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ContainerOptionsError {
    /// Invalid option combination or value
    #[error("invalid container options: {0}")]
    Invalid(String),

    /// An option could not be parsed
    #[error("invalid value '{value}' for {name}")]
    Parse {
        /// Option name
        name: &'static str,
        /// Raw value
        value: String,
    },
}

/// Immutable container configuration
#[derive(Clone, Serialize, Deserialize)]
pub struct ContainerOptions {
    /// Maximum messages in flight per endpoint
    pub max_concurrent_messages: usize,

    /// Maximum messages returned by a single poll
    pub max_messages_per_poll: usize,

    /// Long-poll wait time passed to the provider
    #[serde(with = "duration_millis")]
    pub poll_timeout: Duration,

    /// Maximum time a poll waits for permits
    #[serde(with = "duration_millis")]
    pub max_delay_between_polls: Duration,

    /// Time given to in-flight messages on stop
    #[serde(with = "duration_millis")]
    pub listener_shutdown_timeout: Duration,

    /// Time given to pending acknowledgements on stop
    #[serde(with = "duration_millis")]
    pub acknowledgement_shutdown_timeout: Duration,

    /// Default backpressure chain
    pub back_pressure_mode: BackPressureMode,

    /// Single-message or batch listeners
    pub listener_mode: ListenerMode,

    /// When processed messages are acknowledged
    pub acknowledgement_mode: AcknowledgementMode,

    /// Acknowledgement ordering; defaults depend on the endpoint type
    #[serde(default)]
    pub acknowledgement_ordering: Option<AcknowledgementOrdering>,

    /// Flush interval for batched acknowledgements
    #[serde(default, with = "option_duration_millis")]
    pub acknowledgement_interval: Option<Duration>,

    /// Flush threshold for batched acknowledgements
    #[serde(default)]
    pub acknowledgement_threshold: Option<usize>,

    /// Sleep between limiter checks while the limiter reports zero
    #[serde(with = "duration_millis")]
    pub standby_limit_polling_interval: Duration,

    /// Visibility extended for FIFO messages still waiting in a batch
    #[serde(default, with = "option_duration_millis")]
    pub message_visibility: Option<Duration>,

    /// FIFO batch grouping
    #[serde(default)]
    pub fifo_batch_grouping_strategy: FifoBatchGroupingStrategy,

    /// Back-off applied to the polling loop after provider errors
    #[serde(default)]
    pub poll_back_off: BackOffPolicy,

    /// External capacity ceiling
    #[serde(skip)]
    pub back_pressure_limiter: Option<Arc<dyn BackPressureLimiter>>,

    /// Replaces the default backpressure chain
    #[serde(skip)]
    pub back_pressure_handler_factory: Option<Arc<dyn BackPressureHandlerFactory>>,
}

impl Default for ContainerOptions {
    fn default() -> Self {
        Self {
            max_concurrent_messages: 10,
            max_messages_per_poll: 10,
            poll_timeout: Duration::from_secs(10),
            max_delay_between_polls: Duration::from_secs(10),
            listener_shutdown_timeout: Duration::from_secs(20),
            acknowledgement_shutdown_timeout: Duration::from_secs(20),
            back_pressure_mode: BackPressureMode::Auto,
            listener_mode: ListenerMode::SingleMessage,
            acknowledgement_mode: AcknowledgementMode::OnSuccess,
            acknowledgement_ordering: None,
            acknowledgement_interval: None,
            acknowledgement_threshold: None,
            standby_limit_polling_interval: Duration::from_millis(100),
            message_visibility: None,
            fifo_batch_grouping_strategy: FifoBatchGroupingStrategy::default(),
            poll_back_off: BackOffPolicy::default(),
            back_pressure_limiter: None,
            back_pressure_handler_factory: None,
        }
    }
}

impl fmt::Debug for ContainerOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ContainerOptions")
            .field("max_concurrent_messages", &self.max_concurrent_messages)
            .field("max_messages_per_poll", &self.max_messages_per_poll)
            .field("poll_timeout", &self.poll_timeout)
            .field("max_delay_between_polls", &self.max_delay_between_polls)
            .field("listener_shutdown_timeout", &self.listener_shutdown_timeout)
            .field(
                "acknowledgement_shutdown_timeout",
                &self.acknowledgement_shutdown_timeout,
            )
            .field("back_pressure_mode", &self.back_pressure_mode)
            .field("listener_mode", &self.listener_mode)
            .field("acknowledgement_mode", &self.acknowledgement_mode)
            .field("acknowledgement_ordering", &self.acknowledgement_ordering)
            .field("acknowledgement_interval", &self.acknowledgement_interval)
            .field("acknowledgement_threshold", &self.acknowledgement_threshold)
            .field("message_visibility", &self.message_visibility)
            .field(
                "fifo_batch_grouping_strategy",
                &self.fifo_batch_grouping_strategy,
            )
            .field("back_pressure_limiter", &self.back_pressure_limiter.is_some())
            .field(
                "back_pressure_handler_factory",
                &self.back_pressure_handler_factory.is_some(),
            )
            .finish_non_exhaustive()
    }
}

impl ContainerOptions {
    /// Start building options from the defaults
    pub fn builder() -> ContainerOptionsBuilder {
        ContainerOptionsBuilder {
            options: Self::default(),
        }
    }

    /// Builder seeded with a copy of these options
    pub fn to_builder(&self) -> ContainerOptionsBuilder {
        ContainerOptionsBuilder {
            options: self.clone(),
        }
    }

    /// Validate option invariants
    pub fn validate(&self) -> Result<(), ContainerOptionsError> {
        if self.max_concurrent_messages == 0 {
            return Err(ContainerOptionsError::Invalid(
                "max_concurrent_messages must be greater than zero".into(),
            ));
        }
        if self.max_messages_per_poll == 0 {
            return Err(ContainerOptionsError::Invalid(
                "max_messages_per_poll must be greater than zero".into(),
            ));
        }
        if self.max_messages_per_poll > self.max_concurrent_messages {
            return Err(ContainerOptionsError::Invalid(format!(
                "max_messages_per_poll ({}) exceeds max_concurrent_messages ({})",
                self.max_messages_per_poll, self.max_concurrent_messages
            )));
        }
        if self.max_delay_between_polls.is_zero() {
            return Err(ContainerOptionsError::Invalid(
                "max_delay_between_polls must be greater than zero".into(),
            ));
        }
        if self.standby_limit_polling_interval.is_zero() {
            return Err(ContainerOptionsError::Invalid(
                "standby_limit_polling_interval must be greater than zero".into(),
            ));
        }
        if let Some(visibility) = self.message_visibility {
            if visibility < Duration::from_secs(1) {
                return Err(ContainerOptionsError::Invalid(
                    "message_visibility must be at least one second".into(),
                ));
            }
        }
        Ok(())
    }

    /// Load options from `LISTENER_*` environment variables
    ///
    /// Environment variables:
    /// - `LISTENER_MAX_CONCURRENT_MESSAGES`
    /// - `LISTENER_MAX_MESSAGES_PER_POLL`
    /// - `LISTENER_POLL_TIMEOUT_MS`
    /// - `LISTENER_MAX_DELAY_BETWEEN_POLLS_MS`
    /// - `LISTENER_SHUTDOWN_TIMEOUT_MS`
    /// - `LISTENER_ACKNOWLEDGEMENT_SHUTDOWN_TIMEOUT_MS`
    /// - `LISTENER_BACK_PRESSURE_MODE`: `auto`, `always_poll_max_messages`, `fixed_high_throughput`
    /// - `LISTENER_MODE`: `single_message` or `batch`
    /// - `LISTENER_ACKNOWLEDGEMENT_MODE`: `on_success`, `always` or `never`
    /// - `LISTENER_ACKNOWLEDGEMENT_INTERVAL_MS`
    /// - `LISTENER_ACKNOWLEDGEMENT_THRESHOLD`
    ///
    /// Unset variables keep their defaults.
    pub fn from_env() -> Result<Self, ContainerOptionsError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub(crate) fn from_lookup<F>(lookup: F) -> Result<Self, ContainerOptionsError>
    where
        F: Fn(&str) -> Option<String>,
    {
        fn number<T: std::str::FromStr>(
            name: &'static str,
            value: Option<String>,
        ) -> Result<Option<T>, ContainerOptionsError> {
            value
                .map(|v| {
                    v.trim()
                        .parse::<T>()
                        .map_err(|_| ContainerOptionsError::Parse { name, value: v })
                })
                .transpose()
        }

        let mut builder = Self::builder();
        if let Some(v) =
            number("max_concurrent_messages", lookup("LISTENER_MAX_CONCURRENT_MESSAGES"))?
        {
            builder = builder.max_concurrent_messages(v);
        }
        if let Some(v) =
            number("max_messages_per_poll", lookup("LISTENER_MAX_MESSAGES_PER_POLL"))?
        {
            builder = builder.max_messages_per_poll(v);
        }
        if let Some(v) = number("poll_timeout", lookup("LISTENER_POLL_TIMEOUT_MS"))? {
            builder = builder.poll_timeout(Duration::from_millis(v));
        }
        if let Some(v) = number(
            "max_delay_between_polls",
            lookup("LISTENER_MAX_DELAY_BETWEEN_POLLS_MS"),
        )? {
            builder = builder.max_delay_between_polls(Duration::from_millis(v));
        }
        if let Some(v) = number(
            "listener_shutdown_timeout",
            lookup("LISTENER_SHUTDOWN_TIMEOUT_MS"),
        )? {
            builder = builder.listener_shutdown_timeout(Duration::from_millis(v));
        }
        if let Some(v) = number(
            "acknowledgement_shutdown_timeout",
            lookup("LISTENER_ACKNOWLEDGEMENT_SHUTDOWN_TIMEOUT_MS"),
        )? {
            builder = builder.acknowledgement_shutdown_timeout(Duration::from_millis(v));
        }
        if let Some(v) = lookup("LISTENER_BACK_PRESSURE_MODE") {
            builder = builder.back_pressure_mode(v.parse()?);
        }
        if let Some(v) = lookup("LISTENER_MODE") {
            builder = builder.listener_mode(v.parse()?);
        }
        if let Some(v) = lookup("LISTENER_ACKNOWLEDGEMENT_MODE") {
            builder = builder.acknowledgement_mode(v.parse()?);
        }
        if let Some(v) = number(
            "acknowledgement_interval",
            lookup("LISTENER_ACKNOWLEDGEMENT_INTERVAL_MS"),
        )? {
            builder = builder.acknowledgement_interval(Duration::from_millis(v));
        }
        if let Some(v) = number(
            "acknowledgement_threshold",
            lookup("LISTENER_ACKNOWLEDGEMENT_THRESHOLD"),
        )? {
            builder = builder.acknowledgement_threshold(v);
        }
        builder.build()
    }
}

/// Builder for [`ContainerOptions`]
///
/// # Example
///
/// ```
/// use message_listener::options::{BackPressureMode, ContainerOptions};
/// use std::time::Duration;
///
/// let options = ContainerOptions::builder()
///     .max_concurrent_messages(20)
///     .max_messages_per_poll(10)
///     .poll_timeout(Duration::from_secs(5))
///     .back_pressure_mode(BackPressureMode::FixedHighThroughput)
///     .build()
///     .unwrap();
/// assert_eq!(options.max_concurrent_messages, 20);
/// ```
#[derive(Debug, Clone)]
pub struct ContainerOptionsBuilder {
    options: ContainerOptions,
}

impl ContainerOptionsBuilder {
    /// Set the maximum number of messages in flight per endpoint
    pub fn max_concurrent_messages(mut self, max: usize) -> Self {
        self.options.max_concurrent_messages = max;
        self
    }

    /// Set the maximum number of messages per poll
    pub fn max_messages_per_poll(mut self, max: usize) -> Self {
        self.options.max_messages_per_poll = max;
        self
    }

    /// Set the provider long-poll wait time
    pub fn poll_timeout(mut self, timeout: Duration) -> Self {
        self.options.poll_timeout = timeout;
        self
    }

    /// Set the maximum wait for permits between polls
    pub fn max_delay_between_polls(mut self, delay: Duration) -> Self {
        self.options.max_delay_between_polls = delay;
        self
    }

    /// Set the listener shutdown timeout
    pub fn listener_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.options.listener_shutdown_timeout = timeout;
        self
    }

    /// Set the acknowledgement shutdown timeout
    pub fn acknowledgement_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.options.acknowledgement_shutdown_timeout = timeout;
        self
    }

    /// Set the backpressure mode
    pub fn back_pressure_mode(mut self, mode: BackPressureMode) -> Self {
        self.options.back_pressure_mode = mode;
        self
    }

    /// Set the listener mode
    pub fn listener_mode(mut self, mode: ListenerMode) -> Self {
        self.options.listener_mode = mode;
        self
    }

    /// Set the acknowledgement mode
    pub fn acknowledgement_mode(mut self, mode: AcknowledgementMode) -> Self {
        self.options.acknowledgement_mode = mode;
        self
    }

    /// Set the acknowledgement ordering
    pub fn acknowledgement_ordering(mut self, ordering: AcknowledgementOrdering) -> Self {
        self.options.acknowledgement_ordering = Some(ordering);
        self
    }

    /// Set the acknowledgement flush interval
    pub fn acknowledgement_interval(mut self, interval: Duration) -> Self {
        self.options.acknowledgement_interval = Some(interval);
        self
    }

    /// Set the acknowledgement flush threshold
    pub fn acknowledgement_threshold(mut self, threshold: usize) -> Self {
        self.options.acknowledgement_threshold = Some(threshold);
        self
    }

    /// Set the standby polling interval used while the limiter reports zero
    pub fn standby_limit_polling_interval(mut self, interval: Duration) -> Self {
        self.options.standby_limit_polling_interval = interval;
        self
    }

    /// Extend visibility of FIFO messages still waiting in their batch
    pub fn message_visibility(mut self, visibility: Duration) -> Self {
        self.options.message_visibility = Some(visibility);
        self
    }

    /// Set the FIFO batch grouping strategy
    pub fn fifo_batch_grouping_strategy(mut self, strategy: FifoBatchGroupingStrategy) -> Self {
        self.options.fifo_batch_grouping_strategy = strategy;
        self
    }

    /// Set the poll back-off policy
    pub fn poll_back_off(mut self, policy: BackOffPolicy) -> Self {
        self.options.poll_back_off = policy;
        self
    }

    /// Set an external capacity limiter
    pub fn back_pressure_limiter(mut self, limiter: Arc<dyn BackPressureLimiter>) -> Self {
        self.options.back_pressure_limiter = Some(limiter);
        self
    }

    /// Replace the default backpressure chain
    pub fn back_pressure_handler_factory(
        mut self,
        factory: Arc<dyn BackPressureHandlerFactory>,
    ) -> Self {
        self.options.back_pressure_handler_factory = Some(factory);
        self
    }

    /// Validate and build the options
    pub fn build(self) -> Result<ContainerOptions, ContainerOptionsError> {
        self.options.validate()?;
        Ok(self.options)
    }
}

/// Serde support for Duration as milliseconds
pub(crate) mod duration_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        (duration.as_millis() as u64).serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

pub(crate) mod option_duration_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match duration {
            Some(d) => (d.as_millis() as u64).serialize(serializer),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis: Option<u64> = Option::deserialize(deserializer)?;
        Ok(millis.map(Duration::from_millis))
    }
}

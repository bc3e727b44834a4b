use std::str::FromStr;
use std::time;

use envconfig::Envconfig;
use relay_common::record::Schema;
use relay_common::retry::RetryPolicy;
use relay_common::webhook::MessageOverrides;

use crate::client::ClientSettings;
use crate::encoder::FieldMapping;
use crate::pipeline::PipelineSettings;
use crate::queue::OverflowPolicy;
use crate::resolver::EndpointSettings;

#[derive(Envconfig, Clone)]
pub struct Config {
    #[envconfig(from = "BIND_HOST", default = "0.0.0.0")]
    pub host: String,

    #[envconfig(from = "BIND_PORT", default = "3302")]
    pub port: u16,

    pub webhook_url: Option<String>,

    pub config_file: Option<String>,

    #[envconfig(default = "webhook-relay")]
    pub config_name: String,

    #[envconfig(default = "message:string")]
    pub record_schema: Schema,

    pub message_field: Option<String>,

    pub username_field: Option<String>,

    pub icon_url_field: Option<String>,

    pub icon_emoji_field: Option<String>,

    #[envconfig(from = "WEBHOOK_USERNAME")]
    pub username: Option<String>,

    #[envconfig(from = "WEBHOOK_ICON_URL")]
    pub icon_url: Option<String>,

    #[envconfig(from = "WEBHOOK_ICON_EMOJI")]
    pub icon_emoji: Option<String>,

    #[envconfig(default = "1000")]
    pub delivery_interval: EnvMsDuration,

    #[envconfig(default = "5000")]
    pub request_timeout: EnvMsDuration,

    #[envconfig(default = "5000")]
    pub connect_timeout: EnvMsDuration,

    #[envconfig(default = "1000")]
    pub pool_idle_timeout: EnvMsDuration,

    #[envconfig(default = "8")]
    pub pool_max_idle_per_host: usize,

    #[envconfig(default = "10")]
    pub max_attempts: u32,

    #[envconfig(default = "0")]
    pub max_queue_size: usize,

    #[envconfig(default = "reject")]
    pub overflow_policy: OverflowPolicy,

    #[envconfig(default = "0")]
    pub max_endpoint_age: EnvMsDuration,

    #[envconfig(default = "30000")]
    pub liveness_deadline: EnvMsDuration,

    #[envconfig(nested = true)]
    pub retry_policy: RetryPolicyConfig,
}

impl Config {
    /// Produce a host:port address for binding a TcpListener.
    pub fn bind(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn pipeline_settings(&self) -> PipelineSettings {
        PipelineSettings {
            endpoint: EndpointSettings {
                url: self.webhook_url.clone().filter(|url| !url.is_empty()),
                overrides: MessageOverrides {
                    username: self.username.clone(),
                    icon_url: self.icon_url.clone(),
                    icon_emoji: self.icon_emoji.clone(),
                },
            },
            field_mapping: FieldMapping {
                text: self.message_field.clone(),
                username: self.username_field.clone(),
                icon_url: self.icon_url_field.clone(),
                icon_emoji: self.icon_emoji_field.clone(),
            },
            delivery_interval: self.delivery_interval.0,
            max_queue_size: self.max_queue_size,
            overflow_policy: self.overflow_policy,
            max_endpoint_age: self.max_endpoint_age.0,
            retry_policy: self.retry_policy(),
        }
    }

    pub fn client_settings(&self) -> ClientSettings {
        ClientSettings {
            request_timeout: self.request_timeout.0,
            connect_timeout: self.connect_timeout.0,
            pool_idle_timeout: self.pool_idle_timeout.0,
            pool_max_idle_per_host: self.pool_max_idle_per_host,
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::build(
            self.retry_policy.backoff_coefficient,
            self.retry_policy.initial_interval.0,
        )
        .maximum_interval(self.retry_policy.maximum_interval.0)
        .max_attempts(self.max_attempts)
        .provide()
    }
}

#[derive(Debug, Clone, Copy)]
pub struct EnvMsDuration(pub time::Duration);

#[derive(Debug, PartialEq, Eq)]
pub struct ParseEnvMsDurationError;

impl FromStr for EnvMsDuration {
    type Err = ParseEnvMsDurationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let ms = s.parse::<u64>().map_err(|_| ParseEnvMsDurationError)?;

        Ok(EnvMsDuration(time::Duration::from_millis(ms)))
    }
}

#[derive(Envconfig, Clone)]
pub struct RetryPolicyConfig {
    #[envconfig(default = "2")]
    pub backoff_coefficient: u32,

    #[envconfig(default = "1000")]
    pub initial_interval: EnvMsDuration,

    #[envconfig(default = "60000")]
    pub maximum_interval: EnvMsDuration,
}

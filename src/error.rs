use thiserror::Error;

#[derive(Error, Debug)]
pub enum MeterError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("kafka error: {0}")]
    Kafka(String),

    #[error("zookeeper error: {0}")]
    Zookeeper(String),

    #[error("http server error: {0}")]
    Http(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("regex error: {0}")]
    Regex(#[from] regex::Error),
}

impl From<rdkafka::error::KafkaError> for MeterError {
    fn from(err: rdkafka::error::KafkaError) -> Self {
        MeterError::Kafka(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, MeterError>;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum MqttError {
    #[error("MQTT client error: {0}")]
    Client(#[from] rumqttc::ClientError),
    #[error("Invalid discovery payload: {0}")]
    Payload(String),
}

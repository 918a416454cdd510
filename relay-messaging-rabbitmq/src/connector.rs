use std::sync::Arc;

use async_trait::async_trait;
use lapin::{options::ConfirmSelectOptions, uri::AMQPUri, Connection, ConnectionProperties};
use relay_messaging_core::{BrokerChannel, ConnectionParameters, Connector, MessagingError};
use tracing::info;

use crate::channel::RabbitChannel;

/// Opens one connection per channel, as every publisher and consumer owns
/// its connection.
#[derive(Clone, Debug, Default)]
pub struct RabbitConnector {
    connection_name: Option<String>,
}

impl RabbitConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Name shown for the connection in the broker's management UI.
    pub fn with_connection_name(mut self, name: impl Into<String>) -> Self {
        self.connection_name = Some(name.into());
        self
    }

    fn properties(&self) -> ConnectionProperties {
        let properties = ConnectionProperties::default();
        match &self.connection_name {
            Some(name) => properties.with_connection_name(name.clone().into()),
            None => properties,
        }
    }
}

fn broker_uri(params: &ConnectionParameters) -> Result<AMQPUri, MessagingError> {
    params
        .amqp_uri()
        .parse()
        .map_err(|e| MessagingError::Configuration(format!("invalid broker uri: {e}")))
}

#[async_trait]
impl Connector for RabbitConnector {
    async fn connect(
        &self,
        params: &ConnectionParameters,
    ) -> Result<Arc<dyn BrokerChannel>, MessagingError> {
        let conn = Connection::connect_uri(broker_uri(params)?, self.properties())
            .await
            .map_err(|e| MessagingError::Connectivity(e.to_string()))?;

        let ch = conn
            .create_channel()
            .await
            .map_err(|e| MessagingError::Connectivity(e.to_string()))?;
        ch.confirm_select(ConfirmSelectOptions::default())
            .await
            .map_err(|e| MessagingError::Connectivity(e.to_string()))?;

        info!(
            host = params.host(),
            port = params.port(),
            vhost = params.vhost(),
            channel = ch.id(),
            "RabbitMQ connected"
        );
        Ok(Arc::new(RabbitChannel::new(
            conn,
            ch,
            params.blocked_connection_timeout(),
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reserved_characters_survive_uri_parsing() {
        let params = ConnectionParameters::builder()
            .user("app")
            .password("p@ss/w:rd")
            .host("broker")
            .vhost("/")
            .build()
            .unwrap();

        let uri = broker_uri(&params).unwrap();
        assert_eq!(uri.authority.userinfo.username, "app");
        assert_eq!(uri.authority.userinfo.password, "p@ss/w:rd");
        assert_eq!(uri.authority.host, "broker");
        assert_eq!(uri.authority.port, 5672);
        assert_eq!(uri.vhost, "/");
    }
}

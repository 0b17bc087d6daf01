use crate::descriptor::FileDescriptor;
use crate::error::{GateError, Result};
use serde::Deserialize;
use tracing::debug;

/// Event type announcing a newly created blob
pub const BLOB_CREATED_EVENT: &str = "Microsoft.Storage.BlobCreated";
/// Control message sent by the event grid to validate a subscription endpoint
pub const SUBSCRIPTION_VALIDATION_EVENT: &str = "Microsoft.EventGrid.SubscriptionValidationEvent";
const PUT_BLOB_API: &str = "PutBlob";
const CSV_CONTENT_TYPE: &str = "text/csv";

/// One inbound event grid record, parsed up front instead of probed
/// dynamically. Unknown fields are ignored; missing fields classify the
/// event as not applicable rather than failing deep in the workflow.
#[derive(Debug, Clone, Deserialize)]
pub struct GridEvent {
    #[serde(rename = "eventType")]
    pub event_type: String,
    #[serde(default)]
    pub data: EventData,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct EventData {
    #[serde(default)]
    pub api: Option<String>,
    #[serde(rename = "contentType", default)]
    pub content_type: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(rename = "validationCode", default)]
    pub validation_code: Option<String>,
}

/// What an inbound event means for the workflow
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notification {
    /// Endpoint validation ping; answered with an echo, no workflow effect
    SubscriptionValidation { validation_code: String },
    /// A CSV batch file landed in an inbound folder
    FileArrived(FileDescriptor),
    /// Anything else: wrong event type, wrong content type, wrong folder.
    /// Silently ignored.
    NotApplicable,
}

/// Classify an inbound event.
///
/// Only a `BlobCreated` event for a `text/csv` blob put into an `inbound`
/// folder produces a [`Notification::FileArrived`]. A file whose leading
/// customer token doesn't match its container is a hard
/// [`GateError::NamingConventionViolation`].
pub fn classify(event: &GridEvent) -> Result<Notification> {
    if event.event_type == SUBSCRIPTION_VALIDATION_EVENT {
        let validation_code = event.data.validation_code.clone().ok_or_else(|| {
            GateError::BadNotification("subscription validation event without a code".into())
        })?;
        return Ok(Notification::SubscriptionValidation { validation_code });
    }

    if event.event_type != BLOB_CREATED_EVENT
        || event.data.api.as_deref() != Some(PUT_BLOB_API)
        || event.data.content_type.as_deref() != Some(CSV_CONTENT_TYPE)
    {
        return Ok(Notification::NotApplicable);
    }

    let url = match event.data.url.as_deref() {
        Some(url) => url,
        None => return Ok(Notification::NotApplicable),
    };

    let descriptor = match FileDescriptor::parse(url) {
        Some(d) => d,
        None => {
            debug!(url = %url, "Blob path outside the intake layout, ignoring");
            return Ok(Notification::NotApplicable);
        }
    };

    if descriptor.customer_name != descriptor.container {
        return Err(GateError::NamingConventionViolation {
            filename: descriptor.filename,
            container: descriptor.container,
            customer: descriptor.customer_name,
        });
    }

    Ok(Notification::FileArrived(descriptor))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn blob_created(url: &str) -> GridEvent {
        GridEvent {
            event_type: BLOB_CREATED_EVENT.to_string(),
            data: EventData {
                api: Some("PutBlob".to_string()),
                content_type: Some("text/csv".to_string()),
                url: Some(url.to_string()),
                validation_code: None,
            },
        }
    }

    #[test]
    fn test_csv_put_into_inbound_is_file_arrived() {
        let event = blob_created("https://store.example.com/acme/inbound/acme-0115_type1.csv");
        match classify(&event).unwrap() {
            Notification::FileArrived(d) => {
                assert_eq!(d.customer_name, "acme");
                assert_eq!(d.file_type, "type1");
            }
            other => panic!("expected FileArrived, got {other:?}"),
        }
    }

    #[test]
    fn test_subscription_validation_echoes_code() {
        let event = GridEvent {
            event_type: SUBSCRIPTION_VALIDATION_EVENT.to_string(),
            data: EventData {
                validation_code: Some("abc-123".to_string()),
                ..Default::default()
            },
        };
        assert_eq!(
            classify(&event).unwrap(),
            Notification::SubscriptionValidation {
                validation_code: "abc-123".to_string()
            }
        );
    }

    #[test]
    fn test_wrong_content_type_not_applicable() {
        let mut event = blob_created("/acme/inbound/acme-0115_type1.csv");
        event.data.content_type = Some("application/json".to_string());
        assert_eq!(classify(&event).unwrap(), Notification::NotApplicable);
    }

    #[test]
    fn test_wrong_api_not_applicable() {
        let mut event = blob_created("/acme/inbound/acme-0115_type1.csv");
        event.data.api = Some("PutBlockList".to_string());
        assert_eq!(classify(&event).unwrap(), Notification::NotApplicable);
    }

    #[test]
    fn test_outside_inbound_not_applicable() {
        let event = blob_created("/acme/archive/acme-0115_type1.csv");
        assert_eq!(classify(&event).unwrap(), Notification::NotApplicable);
    }

    #[test]
    fn test_customer_container_mismatch_is_violation() {
        let event = blob_created("/customer2/inbound/acme-0115_type1.csv");
        match classify(&event) {
            Err(GateError::NamingConventionViolation {
                container,
                customer,
                ..
            }) => {
                assert_eq!(container, "customer2");
                assert_eq!(customer, "acme");
            }
            other => panic!("expected naming violation, got {other:?}"),
        }
    }
}

//! Notifications between identities of a safe.
//!
//! Events are sealed for their recipient and signed by their sender, then
//! dropped in the recipient's inbox at `users/<userId>/<eventId>.ev`.

use blob_store::{Filter, Store};
use serde::{Deserialize, Serialize};

use crate::crypto::{self, signature_hex, PublicKey, SecretKey, SecretShare, Signature};

use super::error::SafeError;
use super::identity::user_dir;
use super::key_id::next_id;

const EVENT_SUFFIX: &str = ".ev";

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Event {
    /// The recipient was granted access to a zone
    #[serde(rename_all = "camelCase")]
    ZoneSubscription {
        creator_id: PublicKey,
        zone_name: String,
        name_signature: String,
    },
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SignedEvent {
    event: Event,
    by: PublicKey,
    #[serde(with = "signature_hex")]
    signature: Signature,
}

/// Seal and deliver `event` to `recipient`.
pub async fn send_event(
    store: &dyn Store,
    sender: &SecretKey,
    recipient: &PublicKey,
    event: Event,
) -> Result<(), SafeError> {
    let body = serde_json::to_vec(&event)?;
    let signed = SignedEvent {
        event,
        by: sender.public(),
        signature: crypto::sign_digest(sender, &body),
    };
    let sealed = SecretShare::seal(&serde_json::to_vec(&signed)?, recipient)?;
    let path = format!("{}/{}{EVENT_SUFFIX}", user_dir(recipient), next_id(0));
    store.write(&path, sealed.into(), None).await?;
    tracing::debug!("sent event to {}", recipient);
    Ok(())
}

/// Read and remove every event waiting for `identity`.
///
/// Events that cannot be opened or whose signature fails are dropped.
pub async fn receive_events(
    store: &dyn Store,
    identity: &SecretKey,
) -> Result<Vec<(PublicKey, Event)>, SafeError> {
    let dir = user_dir(&identity.public());
    let mut events = Vec::new();

    for entry in store.read_dir(&dir, &Filter::suffix(EVENT_SUFFIX)).await? {
        let path = format!("{dir}/{}", entry.name);
        match open_event(store, identity, &path).await {
            Ok(event) => events.push(event),
            Err(e) => tracing::warn!("dropping event {}: {}", path, e),
        }
        if let Err(e) = store.delete(&path).await {
            tracing::warn!("cannot delete event {}: {}", path, e);
        }
    }

    Ok(events)
}

async fn open_event(
    store: &dyn Store,
    identity: &SecretKey,
    path: &str,
) -> Result<(PublicKey, Event), SafeError> {
    let sealed = store.read(path, None, None).await?;
    let data = SecretShare::unseal(&sealed, identity)?;
    let signed: SignedEvent = serde_json::from_slice(&data)?;
    let body = serde_json::to_vec(&signed.event)?;
    if !crypto::verify_digest(&signed.by, &body, &signed.signature) {
        return Err(SafeError::SignatureMismatch(path.to_string()));
    }
    Ok((signed.by, signed.event))
}

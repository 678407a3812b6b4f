use crate::{
    chat::Conversation,
    error::{ChatError, Result},
    store::Store,
};
use tracing::{debug, info};

/// Find or create the conversation between `requester_id` (as buyer) and the
/// owner of `offer_id` (as seller).
///
/// Calling this repeatedly, or concurrently, for the same pair always yields
/// the same conversation.
pub async fn resolve_or_create(
    store: &Store,
    requester_id: &str,
    offer_id: &str,
) -> Result<Conversation> {
    if offer_id.trim().is_empty() {
        return Err(ChatError::validation("offerId is required"));
    }

    let offer = store
        .get_offer(offer_id)
        .await?
        .ok_or_else(|| ChatError::not_found("offer"))?;

    let requester = store
        .get_user(requester_id)
        .await?
        .ok_or_else(|| ChatError::not_found("user"))?;

    let seller_id = offer.owner_id.as_str();
    if requester_id == seller_id {
        return Err(ChatError::InvalidOperation(
            "cannot message yourself".to_string(),
        ));
    }
    let buyer_id = requester_id;

    if let Some(existing) = store.find_conversation(offer_id, buyer_id, seller_id).await? {
        debug!("Reusing conversation {} for offer {}", existing.id, offer_id);
        return Ok(existing);
    }

    if let Some(created) = store.insert_conversation(offer_id, buyer_id, seller_id).await? {
        info!(
            "Created conversation {} between {} and seller {} about offer {}",
            created.id, requester, seller_id, offer_id
        );
        return Ok(created);
    }

    // Lost the insert race; the winner's row is what everyone gets.
    debug!("Concurrent insert for offer {}, re-querying", offer_id);
    store
        .find_conversation(offer_id, buyer_id, seller_id)
        .await?
        .ok_or_else(|| ChatError::not_found("conversation"))
}

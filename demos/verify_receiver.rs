use ajo_webhooks::{
    compute_signature, verify_webhook_request, EventEnvelope, EventData, WebhookEventType, ID_HEADER,
    SIGNATURE_HEADER,
};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let secret = b"supersecret";

    // What a sender would produce.
    let envelope = EventEnvelope::new(WebhookEventType::MemberJoined, EventData::new(), None);
    let payload = serde_json::to_vec(&envelope)?;
    let signature = compute_signature(secret, &payload);

    let headers = [(SIGNATURE_HEADER, signature.as_str()), (ID_HEADER, envelope.id.as_str())];

    match verify_webhook_request(headers, &payload, secret) {
        Ok(()) => println!("signature ok for event {}", envelope.id),
        Err(e) => println!("rejected ({}): {e}", e.status_code()),
    }

    let tampered = [payload.as_slice(), b" "].concat();
    if let Err(e) = verify_webhook_request(headers, &tampered, secret) {
        println!("tampered body rejected ({}): {e}", e.status_code());
    }

    Ok(())
}

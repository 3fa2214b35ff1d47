use session_webhook_dispatcher::{
    sign_payload, verify_webhook_request, SIGNATURE_HEADER, TIMESTAMP_HEADER,
};

fn main() {
    let secret = b"supersecret";
    let payload = br#"{"sessionId":"session-a","event":"message","timestamp":1700000000,"data":{}}"#;
    let timestamp = "1700000000";
    let signature = sign_payload(secret, timestamp, payload);

    let headers = [(SIGNATURE_HEADER, signature.as_str()), (TIMESTAMP_HEADER, timestamp)];
    let now_secs = 1_700_000_200;

    match verify_webhook_request(headers, payload, secret, 300, now_secs) {
        Ok(()) => println!("signature ok"),
        Err(e) => println!("rejected: {e}"),
    }

    let late = verify_webhook_request(headers, payload, secret, 300, now_secs + 600);
    println!("late delivery: {late:?}");
}

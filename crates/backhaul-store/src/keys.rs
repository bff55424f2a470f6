//! Key layout in the remote store

/// Hash of client id -> last registration timestamp (RFC 3339)
pub const CLIENTS_KEY: &str = "backhaul:clients";

/// Short-lived liveness marker for a connected client
pub fn client_alive_key(client_id: &str) -> String {
    format!("backhaul:client:{}:alive", client_id)
}

/// Hash holding the scalar fields of one transfer
pub fn transfer_key(transfer_id: &str) -> String {
    format!("backhaul:transfer:{}", transfer_id)
}

//! Redis key space. Exact prefixes are part of the wire contract other
//! deployments of this core rely on; do not rename without a migration.

pub fn server_doc(id: &str) -> String {
    format!("registry:servers:{id}")
}

pub fn server_index(role_or_family: &str) -> String {
    format!("registry:servers:index:{role_or_family}")
}

pub fn proxy_active_doc(id: &str) -> String {
    format!("registry:proxies:active:{id}")
}

pub fn proxy_unavailable_doc(id: &str) -> String {
    format!("registry:proxies:unavailable:{id}")
}

pub const HEARTBEAT_SERVERS: &str = "registry:heartbeat:servers";
pub const HEARTBEAT_PROXIES: &str = "registry:heartbeat:proxies";
pub const DEAD_SERVERS: &str = "registry:dead:servers";
pub const DEAD_PROXIES: &str = "registry:dead:proxies";

pub fn dead_snapshot(kind: &str, id: &str) -> String {
    format!("registry:dead:snapshot:{kind}:{id}")
}

use std::borrow::Cow;

/// Default Minecraft server port, applied when a backend address omits one.
pub const DEFAULT_GAME_PORT: u16 = 25565;

/// Normalize a bind/listen address.
///
/// Config shorthand `":PORT"` means "bind on all interfaces"; `SocketAddr`
/// parsing and the Tokio bind APIs do not accept it, so expand it.
pub fn normalize_bind_addr(addr: &str) -> Cow<'_, str> {
    let addr = addr.trim();
    if addr.starts_with(':') {
        Cow::Owned(format!("0.0.0.0{addr}"))
    } else {
        Cow::Borrowed(addr)
    }
}

/// Append `:port` to a backend address that has none. IPv6 literals must be
/// bracketed for the port to be distinguishable.
pub fn ensure_port(addr: &str, port: u16) -> String {
    let s = addr.trim();
    let after_bracket = match s.rfind(']') {
        Some(pos) => &s[pos + 1..],
        None => s,
    };
    if after_bracket.contains(':') {
        s.to_string()
    } else {
        format!("{s}:{port}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bind_addr_port_only() {
        assert_eq!(normalize_bind_addr(":25565").as_ref(), "0.0.0.0:25565");
        assert_eq!(normalize_bind_addr(" :26666 ").as_ref(), "0.0.0.0:26666");
    }

    #[test]
    fn bind_addr_passthrough() {
        assert_eq!(
            normalize_bind_addr("127.0.0.1:25565").as_ref(),
            "127.0.0.1:25565"
        );
        assert_eq!(normalize_bind_addr("[::]:25565").as_ref(), "[::]:25565");
    }

    #[test]
    fn ensure_port_appends_default() {
        assert_eq!(ensure_port("10.0.0.5", 25565), "10.0.0.5:25565");
        assert_eq!(ensure_port("10.0.0.5:25566", 25565), "10.0.0.5:25566");
        assert_eq!(ensure_port("[2001:db8::1]", 25565), "[2001:db8::1]:25565");
        assert_eq!(
            ensure_port("[2001:db8::1]:25566", 25565),
            "[2001:db8::1]:25566"
        );
    }
}

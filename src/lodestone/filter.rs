use std::{
    collections::HashSet,
    net::{AddrParseError, IpAddr},
};

/// Allow/deny lists applied before any byte is read (IPs) and after the
/// LoginStart sniff (players). An empty allow list admits everyone; the deny
/// list is consulted second and always wins.
#[derive(Debug, Default)]
pub struct Filters {
    allowed_ips: HashSet<IpAddr>,
    denied_ips: HashSet<IpAddr>,
    allowed_players: HashSet<String>,
    denied_players: HashSet<String>,
}

impl Filters {
    pub fn from_lists(
        allowed_ips: &[String],
        denied_ips: &[String],
        allowed_players: &[String],
        denied_players: &[String],
    ) -> Result<Self, AddrParseError> {
        let parse_ips = |list: &[String]| -> Result<HashSet<IpAddr>, AddrParseError> {
            list.iter().map(|s| s.trim().parse()).collect()
        };
        let fold_names = |list: &[String]| -> HashSet<String> {
            list.iter()
                .map(|s| s.trim().to_ascii_lowercase())
                .filter(|s| !s.is_empty())
                .collect()
        };
        Ok(Self {
            allowed_ips: parse_ips(allowed_ips)?,
            denied_ips: parse_ips(denied_ips)?,
            allowed_players: fold_names(allowed_players),
            denied_players: fold_names(denied_players),
        })
    }

    pub fn ip_allowed(&self, ip: IpAddr) -> bool {
        if !self.allowed_ips.is_empty() && !self.allowed_ips.contains(&ip) {
            return false;
        }
        !self.denied_ips.contains(&ip)
    }

    /// Player names are matched case-insensitively.
    pub fn player_allowed(&self, name: &str) -> bool {
        let folded = name.trim().to_ascii_lowercase();
        if !self.allowed_players.is_empty() && !self.allowed_players.contains(&folded) {
            return false;
        }
        !self.denied_players.contains(&folded)
    }

    /// True when login-intent connections need the LoginStart name checked.
    pub fn has_player_rules(&self) -> bool {
        !self.allowed_players.is_empty() || !self.denied_players.is_empty()
    }
}

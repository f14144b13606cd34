pub mod arbiter;

/// service ports never handed to a game server, in addition to everything
/// the named ranges below already fence off
pub const RESERVED_PORTS: &[u16] = &[3306, 5432, 6379, 8080, 8443, 9000, 25565, 27017];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PortRange {
    SystemReserved,
    ProxyExternal,
    MinecraftServers,
    Development,
    MinecraftRcon,
    Ephemeral,
}

impl PortRange {
    pub const ALL: [PortRange; 6] = [
        PortRange::SystemReserved,
        PortRange::ProxyExternal,
        PortRange::MinecraftServers,
        PortRange::Development,
        PortRange::MinecraftRcon,
        PortRange::Ephemeral,
    ];

    pub fn bounds(self) -> (u16, u16) {
        match self {
            PortRange::SystemReserved => (1, 1023),
            PortRange::ProxyExternal => (25500, 25564),
            PortRange::MinecraftServers => (25566, 25999),
            PortRange::Development => (26000, 26999),
            PortRange::MinecraftRcon => (35566, 35999),
            PortRange::Ephemeral => (49152, 65535),
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            PortRange::SystemReserved => "system-reserved",
            PortRange::ProxyExternal => "proxy-external",
            PortRange::MinecraftServers => "minecraft-servers",
            PortRange::Development => "development",
            PortRange::MinecraftRcon => "minecraft-rcon",
            PortRange::Ephemeral => "ephemeral",
        }
    }

    pub fn contains(self, port: u16) -> bool {
        let (start, end) = self.bounds();
        start <= port && port <= end
    }

    pub fn iter(self) -> impl Iterator<Item = u16> + use<> {
        let (start, end) = self.bounds();
        start..=end
    }
}

pub fn is_reserved(port: u16) -> bool {
    RESERVED_PORTS.contains(&port)
}

pub fn in_range(port: u16, range: PortRange) -> bool {
    range.contains(port)
}

/// a port the arbiter is ever allowed to hand out
pub fn is_legal(port: u16) -> bool {
    port >= 1024
        && !is_reserved(port)
        && !PortRange::SystemReserved.contains(port)
        && !PortRange::Ephemeral.contains(port)
}

/// the space non-admin users may reserve from
pub fn in_public_space(port: u16) -> bool {
    PortRange::MinecraftServers.contains(port) || PortRange::Development.contains(port)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigReport {
    pub valid: bool,
    pub errors: Vec<String>,
}

/// static sanity check over the tables above: named ranges must be pairwise
/// disjoint and no reserved port may sit inside any range
pub fn validate_config() -> ConfigReport {
    let mut errors = Vec::new();
    for (i, a) in PortRange::ALL.iter().enumerate() {
        for b in &PortRange::ALL[i + 1..] {
            let (a_start, a_end) = a.bounds();
            let (b_start, b_end) = b.bounds();
            if a_start <= b_end && b_start <= a_end {
                errors.push(format!("ranges {} and {} overlap", a.name(), b.name()));
            }
        }
    }
    for port in RESERVED_PORTS {
        for range in PortRange::ALL {
            if range.contains(*port) {
                errors.push(format!(
                    "reserved port {port} lies inside range {}",
                    range.name()
                ));
            }
        }
    }
    ConfigReport {
        valid: errors.is_empty(),
        errors,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn static_tables_are_consistent() {
        let report = validate_config();
        assert!(report.valid, "{:?}", report.errors);
    }

    #[test]
    fn default_minecraft_port_is_fenced_off() {
        assert!(is_reserved(25565));
        assert!(!is_legal(25565));
        assert!(is_legal(25566));
    }

    #[test]
    fn system_and_ephemeral_space_is_illegal() {
        assert!(!is_legal(80));
        assert!(!is_legal(1023));
        assert!(is_legal(1024));
        assert!(!is_legal(49152));
        assert!(!is_legal(65535));
    }

    #[test]
    fn public_space() {
        assert!(in_public_space(25566));
        assert!(in_public_space(26500));
        assert!(!in_public_space(25565));
        assert!(!in_public_space(35566));
    }

    #[test]
    fn range_membership() {
        assert!(in_range(25566, PortRange::MinecraftServers));
        assert!(in_range(35566, PortRange::MinecraftRcon));
        assert!(!in_range(25565, PortRange::MinecraftServers));
    }
}

#[cfg(test)]
mod proptests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        #[test]
        fn legal_ports_avoid_fenced_space(port in 0u16..=65535) {
            if is_legal(port) {
                prop_assert!(port >= 1024);
                prop_assert!(!is_reserved(port));
                prop_assert!(!PortRange::SystemReserved.contains(port));
                prop_assert!(!PortRange::Ephemeral.contains(port));
            }
        }

        #[test]
        fn ranges_claim_each_port_at_most_once(port in 0u16..=65535) {
            let owners = PortRange::ALL.iter().filter(|r| r.contains(port)).count();
            prop_assert!(owners <= 1);
        }
    }
}

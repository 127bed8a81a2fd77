//! Shared CLI argument parsers.

use unikvm::machine::{MachineVolume, PortMapping};

/// Parse a port mapping specification (`HOST:GUEST[/PROTO]` or `PORT[/PROTO]`).
pub fn parse_port(s: &str) -> Result<PortMapping, String> {
    let (ports, protocol) = match s.split_once('/') {
        Some((ports, proto @ ("tcp" | "udp"))) => (ports, proto),
        Some((_, proto)) => return Err(format!("invalid protocol: {}", proto)),
        None => (s, "tcp"),
    };

    let (host_port, machine_port) = if let Some((host, guest)) = ports.split_once(':') {
        let host: u16 = host
            .parse()
            .map_err(|_| format!("invalid host port: {}", host))?;
        let guest: u16 = guest
            .parse()
            .map_err(|_| format!("invalid guest port: {}", guest))?;
        (host, guest)
    } else {
        let port: u16 = ports.parse().map_err(|_| format!("invalid port: {}", ports))?;
        (port, port)
    };

    Ok(PortMapping {
        host_port,
        machine_port,
        protocol: protocol.to_string(),
    })
}

/// Parse a volume attachment (`NAME[:DEST][:ro]`).
///
/// Without a destination the volume's own mount point is used.
pub fn parse_volume(s: &str) -> Result<MachineVolume, String> {
    let mut parts = s.split(':');
    let volume = parts.next().unwrap_or_default();
    if volume.is_empty() {
        return Err(format!("missing volume name: {}", s));
    }
    let mut destination = "";
    let mut read_only = false;
    for part in parts {
        match part {
            "ro" => read_only = true,
            "rw" => read_only = false,
            p if p.starts_with('/') && destination.is_empty() => destination = p,
            p => return Err(format!("invalid volume option: {}", p)),
        }
    }

    Ok(MachineVolume {
        volume: volume.to_string(),
        source: Default::default(),
        destination: destination.into(),
        read_only,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_port() {
        let p = parse_port("8080:80").unwrap();
        assert_eq!((p.host_port, p.machine_port, p.protocol.as_str()), (8080, 80, "tcp"));

        let p = parse_port("53/udp").unwrap();
        assert_eq!((p.host_port, p.machine_port, p.protocol.as_str()), (53, 53, "udp"));

        assert!(parse_port("80/sctp").is_err());
        assert!(parse_port("x:80").is_err());
        assert!(parse_port("70000").is_err());
    }

    #[test]
    fn test_parse_volume() {
        let v = parse_volume("data:/mnt/data:ro").unwrap();
        assert_eq!(v.volume, "data");
        assert_eq!(v.destination, std::path::PathBuf::from("/mnt/data"));
        assert!(v.read_only);

        let v = parse_volume("data").unwrap();
        assert!(v.destination.as_os_str().is_empty());
        assert!(!v.read_only);

        assert!(parse_volume(":/mnt").is_err());
        assert!(parse_volume("data:relative").is_err());
        assert!(parse_volume("data:/a:/b").is_err());
    }
}

//! Runtime configuration file.
//!
//! Line-oriented `key=value` format read from the RAM filesystem at boot.
//! Recognised keys: `host_ip`, `local_ip` (with an optional `/prefix`),
//! `default_gateway_ip`. `#` starts a comment line; blank lines are
//! skipped; any unknown key is an error.

use tachyon_core::bytes::ByteBuf;
use tachyon_core::error::{Errno, KResult};

use crate::fs::ramfs::RamFs;
use crate::net::addr::{parse_ipv4, Ipv4Addr};

/// Largest accepted config file.
pub const CONFIG_MAX_LEN: usize = 4096;

/// Parsed runtime configuration. Every key is optional in the parser;
/// consumers decide what is mandatory.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RuntimeConfig {
    /// Address of the host we expect to talk to first.
    pub host_ip: Option<Ipv4Addr>,
    /// Our own address.
    pub local_ip: Option<Ipv4Addr>,
    /// Netmask derived from `local_ip`'s prefix.
    pub local_ip_mask: Option<Ipv4Addr>,
    /// Default gateway.
    pub default_gateway_ip: Option<Ipv4Addr>,
}

/// Parses the configuration text.
pub fn parse(text: &str) -> KResult<RuntimeConfig> {
    let mut cfg = RuntimeConfig::default();

    for line in text.split('\n') {
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let (key, value) = line.split_once('=').ok_or(Errno::Einval)?;
        match key {
            "host_ip" => {
                cfg.host_ip = Some(parse_ipv4(value)?.addr);
            }
            "local_ip" => {
                let parsed = parse_ipv4(value)?;
                cfg.local_ip = Some(parsed.addr);
                cfg.local_ip_mask = Some(parsed.mask);
            }
            "default_gateway_ip" => {
                cfg.default_gateway_ip = Some(parse_ipv4(value)?.addr);
            }
            _ => return Err(Errno::Einval),
        }
    }

    Ok(cfg)
}

/// Reads and parses the config file at `path` in `fs`.
pub fn load(fs: &mut RamFs<'_>, path: &str) -> KResult<RuntimeConfig> {
    let node = fs.open(path)?;
    if fs.size(node) > CONFIG_MAX_LEN {
        return Err(Errno::Enomem);
    }

    let mut backing = [0u8; CONFIG_MAX_LEN];
    let mut buf = ByteBuf::new(&mut backing);
    let n = fs.read(node, &mut buf, 0)?;
    debug_assert_eq!(n, fs.size(node));

    let text = core::str::from_utf8(buf.as_slice()).map_err(|_| Errno::Einval)?;
    parse(text)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::ramfs::tests::TEST_ALLOC;

    #[test]
    fn full_config_parses() {
        let cfg = parse(
            "# boot-time network setup\n\
             host_ip=10.0.2.2\n\
             local_ip=10.0.2.15/24\n\
             default_gateway_ip=10.0.2.2\n",
        )
        .unwrap();
        assert_eq!(cfg.host_ip, Some(Ipv4Addr::new(10, 0, 2, 2)));
        assert_eq!(cfg.local_ip, Some(Ipv4Addr::new(10, 0, 2, 15)));
        assert_eq!(cfg.local_ip_mask, Some(Ipv4Addr::new(255, 255, 255, 0)));
        assert_eq!(cfg.default_gateway_ip, Some(Ipv4Addr::new(10, 0, 2, 2)));
    }

    #[test]
    fn local_ip_without_prefix_means_host_mask() {
        let cfg = parse("local_ip=192.168.7.3\n").unwrap();
        assert_eq!(cfg.local_ip, Some(Ipv4Addr::new(192, 168, 7, 3)));
        assert_eq!(cfg.local_ip_mask, Some(Ipv4Addr::new(255, 255, 255, 255)));
    }

    #[test]
    fn comments_and_blank_lines_are_skipped() {
        let cfg = parse("\n# nothing here\n\n# still nothing\n").unwrap();
        assert_eq!(cfg, RuntimeConfig::default());
    }

    #[test]
    fn unknown_key_is_einval() {
        assert_eq!(parse("mtu=9000\n").unwrap_err(), Errno::Einval);
    }

    #[test]
    fn malformed_line_is_einval() {
        assert_eq!(parse("host_ip 10.0.2.2\n").unwrap_err(), Errno::Einval);
        assert_eq!(parse("host_ip=not.an.ip.addr\n").unwrap_err(), Errno::Einval);
    }

    #[test]
    fn load_from_ramfs() {
        let mut fs = RamFs::new(&TEST_ALLOC).unwrap();
        let file = fs.create_file("/boot/boot.cfg", true).unwrap();
        fs.write(file, b"local_ip=10.0.2.15/24\ndefault_gateway_ip=10.0.2.2\n", 0)
            .unwrap();

        let cfg = load(&mut fs, "/boot/boot.cfg").unwrap();
        assert_eq!(cfg.local_ip, Some(Ipv4Addr::new(10, 0, 2, 15)));
        assert_eq!(cfg.default_gateway_ip, Some(Ipv4Addr::new(10, 0, 2, 2)));
    }

    #[test]
    fn missing_file_is_enoent() {
        let mut fs = RamFs::new(&TEST_ALLOC).unwrap();
        assert_eq!(load(&mut fs, "/boot/boot.cfg").unwrap_err(), Errno::Enoent);
    }
}

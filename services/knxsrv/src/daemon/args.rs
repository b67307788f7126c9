//! knxd command line construction and input validation
//!
//! Every config value that ends up on the knxd command line passes one of the
//! validators below first; knxd is spawned without a shell, but a backend
//! string like `usb:/dev/x -b ip:` would still inject extra options.

use regex::Regex;

use crate::config::{BackendKind, KnxdConfig};
use crate::error::{KnxSrvError, Result};

const INDIVIDUAL_ADDRESS_PATTERN: &str = r"^\d{1,2}\.\d{1,2}\.\d{1,3}$";
const CLIENT_RANGE_PATTERN: &str = r"^\d{1,2}\.\d{1,2}\.\d{1,3}:\d+$";
const USB_ID_PATTERN: &str = r"^[0-9a-fA-F]{4}$";
const SAFE_PATH_PATTERN: &str = r"^[a-zA-Z0-9_\-/:.]+$";

/// Default KNX/IP tunnelling port
pub const DEFAULT_TUNNEL_PORT: u16 = 3671;

fn is_match(pattern: &str, value: &str) -> Result<bool> {
    let re = Regex::new(pattern)
        .map_err(|e| KnxSrvError::internal(format!("invalid pattern {}: {}", pattern, e)))?;
    Ok(re.is_match(value))
}

/// `area.line.device` with area/line 0-15 and device 0-255
pub fn validate_individual_address(addr: &str) -> Result<()> {
    if !is_match(INDIVIDUAL_ADDRESS_PATTERN, addr)? {
        return Err(KnxSrvError::config(format!(
            "invalid KNX address '{}' (expected area.line.device)",
            addr
        )));
    }
    check_address_ranges(addr)
}

fn check_address_ranges(addr: &str) -> Result<()> {
    let parts: Vec<u32> = addr
        .split('.')
        .map(|p| p.parse::<u32>())
        .collect::<std::result::Result<_, _>>()
        .map_err(|_| KnxSrvError::config(format!("invalid KNX address '{}'", addr)))?;
    match parts.as_slice() {
        [area, line, device] if *area <= 15 && *line <= 15 && *device <= 255 => Ok(()),
        _ => Err(KnxSrvError::config(format!(
            "KNX address '{}' out of range (max 15.15.255)",
            addr
        ))),
    }
}

/// `area.line.device:count`, count 1-255
pub fn validate_client_addresses(range: &str) -> Result<()> {
    if !is_match(CLIENT_RANGE_PATTERN, range)? {
        return Err(KnxSrvError::config(format!(
            "invalid client address range '{}' (expected area.line.device:count)",
            range
        )));
    }
    let (addr, count) = range
        .split_once(':')
        .ok_or_else(|| KnxSrvError::config(format!("invalid client address range '{}'", range)))?;
    check_address_ranges(addr)?;
    match count.parse::<u32>() {
        Ok(n) if (1..=255).contains(&n) => Ok(()),
        _ => Err(KnxSrvError::config(format!(
            "client address count in '{}' must be 1-255",
            range
        ))),
    }
}

/// Four hex digits (`0e77`)
pub fn validate_usb_id(id: &str, field: &str) -> Result<()> {
    if is_match(USB_ID_PATTERN, id)? {
        Ok(())
    } else {
        Err(KnxSrvError::config(format!(
            "{}: '{}' is not a 4-digit hex USB id",
            field, id
        )))
    }
}

/// Paths, hosts and interface names: no whitespace or shell metacharacters
pub fn validate_safe_path(value: &str, field: &str) -> Result<()> {
    if is_match(SAFE_PATH_PATTERN, value)? && !value.contains("..") {
        Ok(())
    } else {
        Err(KnxSrvError::config(format!(
            "{}: '{}' contains unsupported characters",
            field, value
        )))
    }
}

/// `-b` backend argument
pub fn backend_arg(config: &KnxdConfig) -> Result<String> {
    match config.backend {
        BackendKind::Usb => Ok(match config.usb_device.as_deref() {
            Some(dev) if !dev.is_empty() => format!("usb:{}", dev),
            _ => "usb:".to_string(),
        }),
        BackendKind::IpTunnel => {
            let host = config
                .tunnel_host
                .as_deref()
                .filter(|h| !h.is_empty())
                .ok_or_else(|| KnxSrvError::config("ip_tunnel backend requires tunnel_host"))?;
            let port = if config.tunnel_port == 0 {
                DEFAULT_TUNNEL_PORT
            } else {
                config.tunnel_port
            };
            Ok(format!("ipt:{}:{}", host, port))
        },
        BackendKind::IpRouting => {
            let mut arg = format!("ip:{}", config.multicast_address);
            if let Some(iface) = config.multicast_interface.as_deref().filter(|i| !i.is_empty()) {
                arg.push('@');
                arg.push_str(iface);
            }
            Ok(arg)
        },
    }
}

/// Full knxd argument list; the backend is always last
pub fn build_args(config: &KnxdConfig) -> Result<Vec<String>> {
    config.validate()?;

    let mut args = vec![
        "-e".to_string(),
        config.physical_address.clone(),
        "-E".to_string(),
        config.client_addresses.clone(),
    ];
    if let Some(socket) = config.unix_socket.as_deref().filter(|s| !s.is_empty()) {
        args.push("-u".to_string());
        args.push(socket.to_string());
    }
    args.push(format!("-i{}", config.tcp_port));
    if config.group_cache {
        args.push("-c".to_string());
    }
    if config.log_level > 0 {
        args.push(format!("-f{}", config.log_level));
    }
    if config.trace_flags > 0 {
        args.push(format!("-t{}", config.trace_flags));
    }
    args.push("-b".to_string());
    args.push(backend_arg(config)?);
    Ok(args)
}

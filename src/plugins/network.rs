//! Guest network configuration.
//!
//! With `ip` left at `dhcp` nothing is derived. A static address fills in
//! whatever the user did not give: the netmask from the address class, then
//! network, broadcast, gateway (first host of the network) and DNS (the
//! gateway).

use crate::context::{NicKind, Vm};
use crate::error::{Error, Result};
use crate::plugin::Plugin;
use crate::settings::{Setting, SettingKind, Settings};
use std::net::Ipv4Addr;
use tracing::debug;

pub struct NetworkPlugin;

impl NetworkPlugin {
    pub fn create(settings: &mut Settings) -> Result<Box<dyn Plugin>> {
        let group = "Network";
        settings.register(
            Setting::new("ip", SettingKind::Str, "IP address in dotted form.")
                .group(group)
                .default_value("dhcp"),
        )?;
        for (name, help) in [
            ("mac", "MAC address of the guest [default: random]."),
            ("mask", "IP mask in dotted form [default: based on ip setting]."),
            ("net", "IP net address in dotted form [default: based on ip setting]."),
            ("bcast", "IP broadcast in dotted form [default: based on ip setting]."),
            ("gw", "Gateway address in dotted form [default: first address in the network]."),
            ("dns", "DNS address in dotted form [default: the gateway]."),
        ] {
            settings.register(Setting::new(name, SettingKind::Str, help).group(group))?;
        }
        Ok(Box::new(NetworkPlugin))
    }
}

/// `aa:bb:cc:dd:ee:ff`, hex digits in either case.
pub fn validate_mac(mac: &str) -> bool {
    let octets: Vec<&str> = mac.split(':').collect();
    octets.len() == 6
        && octets
            .iter()
            .all(|o| o.len() == 2 && o.chars().all(|c| c.is_ascii_hexdigit()))
}

fn parse_ip(value: &str) -> Result<Ipv4Addr> {
    value
        .parse()
        .map_err(|_| Error::config(format!("{value} is not a valid ip address")))
}

/// Classful netmask for `ip`.
pub fn guess_mask(ip: Ipv4Addr) -> Result<Ipv4Addr> {
    match ip.octets()[0] {
        1..=127 => Ok(Ipv4Addr::new(255, 0, 0, 0)),
        128..=191 => Ok(Ipv4Addr::new(255, 255, 0, 0)),
        0 | 192..=223 => Ok(Ipv4Addr::new(255, 255, 255, 0)),
        _ => Err(Error::config(format!("Could not guess network class of: {ip}"))),
    }
}

/// Addresses derived from an IP and netmask.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Derived {
    pub net: Ipv4Addr,
    pub bcast: Ipv4Addr,
    pub gw: Ipv4Addr,
}

pub fn derive(ip: Ipv4Addr, mask: Ipv4Addr) -> Derived {
    let ip = u32::from(ip);
    let mask = u32::from(mask);
    let net = ip & mask;
    Derived {
        net: Ipv4Addr::from(net),
        bcast: Ipv4Addr::from(net | !mask),
        gw: Ipv4Addr::from(net.wrapping_add(1)),
    }
}

fn opt_ip(vm: &Vm, name: &str) -> Result<Option<Ipv4Addr>> {
    vm.settings.get_str(name)?.map(parse_ip).transpose()
}

impl Plugin for NetworkPlugin {
    fn name(&self) -> &str {
        "Network"
    }

    /// Validate the configuration and fill in derived defaults.
    fn preflight_check(&mut self, vm: &mut Vm) -> Result<()> {
        if let Some(mac) = vm.settings.get_str("mac")? {
            if !validate_mac(mac) {
                return Err(Error::config(format!("Malformed MAC address entered: {mac}")));
            }
        }

        let ip = vm.settings.get_str("ip")?.unwrap_or("dhcp").to_string();
        debug!("ip: {}", ip);
        if ip == "dhcp" {
            return Ok(());
        }

        let ip = parse_ip(&ip)?;
        let mask = match opt_ip(vm, "mask")? {
            Some(mask) => mask,
            None => guess_mask(ip)?,
        };
        let derived = derive(ip, mask);

        let settings = &mut vm.settings;
        settings.set_default("mask", mask.to_string())?;
        settings.set_default("net", derived.net.to_string())?;
        settings.set_default("bcast", derived.bcast.to_string())?;
        settings.set_default("gw", derived.gw.to_string())?;
        let gw = settings.get_str("gw")?.unwrap_or_default().to_string();
        settings.set_default("dns", gw)?;

        for name in ["net", "mask", "bcast", "gw", "dns"] {
            let value = opt_ip(vm, name)?;
            debug!("{}: {:?}", name, value);
        }
        Ok(())
    }

    fn configure_networking(&mut self, vm: &mut Vm) -> Result<()> {
        let ip = vm.settings.get_str("ip")?.unwrap_or("dhcp").to_string();
        let static_config = if ip == "dhcp" {
            None
        } else {
            Some((
                parse_ip(&ip)?,
                opt_ip(vm, "net")?,
                opt_ip(vm, "mask")?,
                opt_ip(vm, "bcast")?,
                opt_ip(vm, "gw")?,
                opt_ip(vm, "dns")?,
            ))
        };
        let mac = vm.settings.get_str("mac")?.map(str::to_string);

        let Some(nic) = vm.nics.first_mut() else {
            return Ok(());
        };
        nic.mac = mac;
        match static_config {
            None => nic.kind = NicKind::Dhcp,
            Some((ip, network, netmask, broadcast, gateway, dns)) => {
                nic.kind = NicKind::Static;
                nic.ip = Some(ip);
                nic.network = network;
                nic.netmask = netmask;
                nic.broadcast = broadcast;
                nic.gateway = gateway;
                nic.dns = dns;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::Nic;
    use crate::process::testing::RecordingRunner;
    use std::rc::Rc;
    use tempfile::TempDir;

    fn vm(temp: &TempDir) -> (Vm, Box<dyn Plugin>) {
        let mut vm = Vm::with_runner(temp.path(), Rc::new(RecordingRunner::new()));
        let plugin = NetworkPlugin::create(&mut vm.settings).unwrap();
        vm.nics.push(Nic::default());
        (vm, plugin)
    }

    #[test]
    fn test_validate_mac() {
        assert!(validate_mac("00:16:3E:aa:bb:cc"));
        assert!(!validate_mac("00:16:3e:aa:bb"));
        assert!(!validate_mac("00:16:3e:aa:bb:zz"));
        assert!(!validate_mac("0016.3eaa.bbcc"));
    }

    #[test]
    fn test_guess_mask() {
        assert_eq!(
            guess_mask("10.1.2.3".parse().unwrap()).unwrap(),
            Ipv4Addr::new(255, 0, 0, 0)
        );
        assert_eq!(
            guess_mask("172.16.0.9".parse().unwrap()).unwrap(),
            Ipv4Addr::new(255, 255, 0, 0)
        );
        assert_eq!(
            guess_mask("192.168.1.20".parse().unwrap()).unwrap(),
            Ipv4Addr::new(255, 255, 255, 0)
        );
        assert!(guess_mask("230.0.0.1".parse().unwrap()).is_err());
    }

    #[test]
    fn test_derive() {
        let d = derive(Ipv4Addr::new(192, 168, 1, 20), Ipv4Addr::new(255, 255, 255, 0));
        assert_eq!(d.net, Ipv4Addr::new(192, 168, 1, 0));
        assert_eq!(d.bcast, Ipv4Addr::new(192, 168, 1, 255));
        assert_eq!(d.gw, Ipv4Addr::new(192, 168, 1, 1));
    }

    #[test]
    fn test_static_ip_fills_defaults_and_nic() {
        let temp = TempDir::new().unwrap();
        let (mut vm, mut plugin) = vm(&temp);
        vm.settings.set("ip", "10.0.5.7").unwrap();
        vm.settings.set("gw", "10.0.0.254").unwrap();

        plugin.preflight_check(&mut vm).unwrap();
        assert_eq!(vm.settings.get_str("mask").unwrap(), Some("255.0.0.0"));
        assert_eq!(vm.settings.get_str("net").unwrap(), Some("10.0.0.0"));
        assert_eq!(vm.settings.get_str("bcast").unwrap(), Some("10.255.255.255"));
        assert_eq!(vm.settings.get_str("gw").unwrap(), Some("10.0.0.254"));
        assert_eq!(vm.settings.get_str("dns").unwrap(), Some("10.0.0.254"));

        plugin.configure_networking(&mut vm).unwrap();
        let nic = &vm.nics[0];
        assert_eq!(nic.kind, NicKind::Static);
        assert_eq!(nic.ip, Some(Ipv4Addr::new(10, 0, 5, 7)));
        assert_eq!(nic.gateway, Some(Ipv4Addr::new(10, 0, 0, 254)));
        assert_eq!(nic.dns, Some(Ipv4Addr::new(10, 0, 0, 254)));
    }

    #[test]
    fn test_dhcp_derives_nothing() {
        let temp = TempDir::new().unwrap();
        let (mut vm, mut plugin) = vm(&temp);

        plugin.preflight_check(&mut vm).unwrap();
        plugin.configure_networking(&mut vm).unwrap();
        assert_eq!(vm.settings.get_str("net").unwrap(), None);
        assert_eq!(vm.nics[0].kind, NicKind::Dhcp);
    }

    #[test]
    fn test_bad_input_is_rejected() {
        let temp = TempDir::new().unwrap();
        let (mut vm, mut plugin) = vm(&temp);
        vm.settings.set("mac", "not-a-mac").unwrap();
        assert!(plugin.preflight_check(&mut vm).is_err());

        let (mut vm, mut plugin) = self::vm(&temp);
        vm.settings.set("ip", "300.1.1.1").unwrap();
        assert!(matches!(
            plugin.preflight_check(&mut vm),
            Err(Error::Configuration(_))
        ));
    }
}

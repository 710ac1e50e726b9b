use std::net::Ipv4Addr;

use smoltcp::iface::{Config, Interface};
use smoltcp::wire::{HardwareAddress, IpCidr};

use crate::stub_device::InMemoryDevice;

/// Creates the one synthetic interface terminating the tunnel's IP stream.
///
/// The interface carries the address the VPN concentrator assigned to us and
/// routes everything else through the concentrator-side gateway.
pub(crate) fn create_interface(
    device: &mut InMemoryDevice,
    ip: Ipv4Addr,
    netmask: Ipv4Addr,
    gateway: Ipv4Addr,
    now: smoltcp::time::Instant,
) -> Interface {
    let mut interface = Interface::new(Config::new(HardwareAddress::Ip), device, now);

    interface.update_ip_addrs(|ips| {
        ips.push(IpCidr::new(ip.into(), prefix_len(netmask)))
            .expect("a fresh interface has room for one address");
    });

    interface
        .routes_mut()
        .add_default_ipv4_route(gateway)
        .expect("a fresh route table has room for one route");

    interface
}

fn prefix_len(netmask: Ipv4Addr) -> u8 {
    u32::from(netmask).count_ones() as u8
}

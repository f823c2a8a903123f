//! Interface state and bit-rate through rtnetlink.

use std::fmt::Debug;

use socketcan::CanInterface;

use crate::{Error, Result};

fn netlink<E: Debug>(interface: &str) -> impl FnOnce(E) -> Error + '_ {
    move |e| Error::Netlink {
        interface: interface.to_owned(),
        message: format!("{e:?}"),
    }
}

/// Brings `interface` up at `bitrate`.
///
/// A down interface gets the bit-rate set and is brought up. An interface
/// that is already up at a different bit-rate is cycled, the kernel refuses
/// bit-rate changes on a running link.
pub fn configure(interface: &str, bitrate: u32) -> Result<()> {
    let link = CanInterface::open(interface).map_err(netlink(interface))?;
    let details = link.details().map_err(netlink(interface))?;

    if !details.is_up {
        log::debug!("{interface} is down, bringing it up at {bitrate} bit/s");
        // Virtual interfaces have no bit-rate.
        if let Err(e) = link.set_bitrate(bitrate, None::<u32>) {
            log::debug!("could not set bit-rate of {interface}: {e:?}");
        }
        return link.bring_up().map_err(netlink(interface));
    }

    match link.bit_rate() {
        Ok(Some(current)) if current != bitrate => {
            log::info!("{interface} runs at {current} bit/s, switching to {bitrate}");
            link.bring_down().map_err(netlink(interface))?;
            link.set_bitrate(bitrate, None::<u32>).map_err(netlink(interface))?;
            link.bring_up().map_err(netlink(interface))
        }
        _ => Ok(()),
    }
}

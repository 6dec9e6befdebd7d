/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */

use transport_core::address::MacAddress;

/// The raw 802.11 link as the bearer consumes it.
///
/// A production implementation forwards frames to the privileged radio
/// helper; tests wire two plugins together in memory. Frames handed to
/// `transmit` never exceed the MTU minus the link encapsulation overhead,
/// and inbound frames enter the plugin through
/// [`crate::plugin::WlanPlugin::handle_link_frame`].
pub trait WlanLink: Send + Sync + 'static {
    /// This station's own MAC.
    fn local_mac(&self) -> MacAddress;

    /// Hand one frame to the radio for `dest`. Best effort; the return is
    /// the frame length on acceptance.
    fn transmit(&self, dest: &MacAddress, frame: &[u8]) -> std::io::Result<usize>;
}

/// An in-memory link that hands transmitted frames to a callback. Used by
/// tests and by harnesses that splice two stacks together directly.
pub struct ChannelLink {
    mac: MacAddress,
    tx: tokio::sync::mpsc::UnboundedSender<(MacAddress, Vec<u8>)>,
}

impl ChannelLink {
    /// Returns the link and the stream of frames "on the air".
    pub fn new(mac: MacAddress) -> (Self, tokio::sync::mpsc::UnboundedReceiver<(MacAddress, Vec<u8>)>) {
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        (Self { mac, tx }, rx)
    }
}

impl WlanLink for ChannelLink {
    fn local_mac(&self) -> MacAddress {
        self.mac
    }

    fn transmit(&self, dest: &MacAddress, frame: &[u8]) -> std::io::Result<usize> {
        self.tx
            .send((*dest, frame.to_vec()))
            .map_err(|_| std::io::Error::new(std::io::ErrorKind::NotConnected, "link closed"))?;
        Ok(frame.len())
    }
}

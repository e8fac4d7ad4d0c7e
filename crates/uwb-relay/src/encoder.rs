//! Downstream message encoders.
//!
//! The controller's wire format is owned by the controller firmware, not by
//! the relay. The relay only needs an encoder that turns
//! `(channel_id, distance_mm)` into bytes on the outbound link.

use crate::error::LinkError;
use crate::link::LinkWriter;

pub trait DownstreamEncoder: Send {
    fn encode_and_send(
        &mut self,
        channel_id: u8,
        distance_mm: u16,
        link: &mut dyn LinkWriter,
    ) -> Result<(), LinkError>;
}

impl<F> DownstreamEncoder for F
where
    F: FnMut(u8, u16, &mut dyn LinkWriter) -> Result<(), LinkError> + Send,
{
    fn encode_and_send(
        &mut self,
        channel_id: u8,
        distance_mm: u16,
        link: &mut dyn LinkWriter,
    ) -> Result<(), LinkError> {
        self(channel_id, distance_mm, link)
    }
}

/// ASCII `"<channel_id>,<distance_mm>\n"`, one line per forward.
#[derive(Debug, Clone, Copy, Default)]
pub struct LineEncoder;

impl LineEncoder {
    pub fn encode(channel_id: u8, distance_mm: u16) -> String {
        format!("{channel_id},{distance_mm}\n")
    }
}

impl DownstreamEncoder for LineEncoder {
    fn encode_and_send(
        &mut self,
        channel_id: u8,
        distance_mm: u16,
        link: &mut dyn LinkWriter,
    ) -> Result<(), LinkError> {
        link.write(Self::encode(channel_id, distance_mm).as_bytes())
    }
}

use std::{
    io,
    sync::{Arc, Mutex as SyncMutex},
};

use tokio::{io::AsyncWriteExt, sync::Mutex as AsyncMutex};

use crate::{
    error::ConnectionError,
    frame::{Goaway, Setting, Settings},
    quic::BoxWriteHalf,
    stream::StreamHandle,
    varint::VarInt,
};

/// Slots for the one outbound control stream and the three recognized
/// peer-originated unidirectional streams. One mutex covers all four slots
/// and GOAWAY dispatch; it may be held across the send because the outbound
/// control stream is owned solely by this connection.
pub(crate) struct ControlChannels {
    slots: AsyncMutex<Slots>,
    peer_settings: SyncMutex<Settings>,
}

#[derive(Default)]
struct Slots {
    outbound: Option<BoxWriteHalf>,
    inbound_control: Option<Arc<StreamHandle>>,
    inbound_encoder: Option<Arc<StreamHandle>>,
    inbound_decoder: Option<Arc<StreamHandle>>,
}

impl ControlChannels {
    pub(crate) fn new() -> Self {
        Self {
            slots: AsyncMutex::new(Slots::default()),
            peer_settings: SyncMutex::new(Settings::default()),
        }
    }

    pub(crate) async fn set_outbound(&self, writer: BoxWriteHalf) {
        let mut slots = self.slots.lock().await;
        debug_assert!(slots.outbound.is_none(), "outbound control stream opened twice");
        slots.outbound = Some(writer);
    }

    /// Claim the inbound control-stream slot. Returns true on the first
    /// claim, false thereafter.
    pub(crate) async fn on_inbound_control_stream(&self, stream: Arc<StreamHandle>) -> bool {
        let mut slots = self.slots.lock().await;
        match slots.inbound_control {
            Some(_) => false,
            None => {
                slots.inbound_control = Some(stream);
                true
            }
        }
    }

    pub(crate) async fn on_inbound_encoder_stream(&self, stream: Arc<StreamHandle>) -> bool {
        let mut slots = self.slots.lock().await;
        match slots.inbound_encoder {
            Some(_) => false,
            None => {
                slots.inbound_encoder = Some(stream);
                true
            }
        }
    }

    pub(crate) async fn on_inbound_decoder_stream(&self, stream: Arc<StreamHandle>) -> bool {
        let mut slots = self.slots.lock().await;
        match slots.inbound_decoder {
            Some(_) => false,
            None => {
                slots.inbound_decoder = Some(stream);
                true
            }
        }
    }

    /// Ingest one setting from the peer's SETTINGS frame. The QPACK effect is
    /// deferred to the QPACK collaborator; unknown identifiers are a protocol
    /// violation.
    pub(crate) fn on_inbound_control_stream_setting(
        &self,
        setting: Setting,
    ) -> Result<(), ConnectionError> {
        match setting.id {
            Setting::QPACK_MAX_TABLE_CAPACITY_ID
            | Setting::MAX_FIELD_SECTION_SIZE_ID
            | Setting::QPACK_BLOCKED_STREAMS_ID => {
                self.peer_settings.lock().unwrap().set(setting);
                Ok(())
            }
            id => Err(ConnectionError::UnexpectedSetting { id }),
        }
    }

    pub(crate) fn peer_settings(&self) -> Settings {
        self.peer_settings.lock().unwrap().clone()
    }

    /// Write a GOAWAY frame on the outbound control stream. A no-op when the
    /// stream has not been opened yet: the connection has not progressed far
    /// enough for the peer to expect one.
    pub(crate) async fn send_goaway(&self, stream_id: VarInt) -> io::Result<()> {
        let mut slots = self.slots.lock().await;
        let Some(writer) = slots.outbound.as_mut() else {
            return Ok(());
        };
        let frame = Goaway::new(stream_id).encode_frame();
        writer.write_all(&frame).await?;
        writer.flush().await
    }
}

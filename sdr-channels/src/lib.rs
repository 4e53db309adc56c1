//! WhatsApp transport for the SDR agent.
//!
//! Adapters are pure I/O: they convert Evolution API payloads to/from
//! `InboundMessage` / `OutboundMessage`.

mod evolution;
mod phone;
mod traits;
mod types;

pub use evolution::{EVOLUTION_CHANNEL_ID, EvolutionAdapter, parse_webhook_event};
pub use phone::{digits_only, is_plausible_phone, normalize_phone, whatsapp_jid};
pub use traits::ChannelAdapter;
pub use types::{ChannelId, InboundContentKind, InboundMessage, MessageId, OutboundMessage};

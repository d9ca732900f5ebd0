//! Cross-worker mailbox payload codecs.
//!
//! Three message kinds travel between workers, all little-endian:
//!
//! - `TASK`: `[u8=1][u64 task_id][u64 result_slot]`
//! - `ACTOR`: `[u8=2][64-byte hex signature][u64 to_len][u64 from_len]
//!   [u64 type_len][u64 msg_len][to][from][type][msg]`
//! - `TICK`: `[u8=3]`

pub const MSG_TASK: u8 = 1;
pub const MSG_ACTOR: u8 = 2;
pub const MSG_TICK: u8 = 3;

const SIGNATURE_LEN: usize = 64;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MailboxMessage {
    Task {
        task_id: u64,
        /// Slot under which the pool parked the boxed result. Kept as a full
        /// word on the wire.
        result_slot: u64,
    },
    Actor {
        /// Lower-case hex HMAC-SHA256 over `to,from,type,message`.
        signature: String,
        to: String,
        from: String,
        kind: String,
        message: String,
    },
    Tick,
}

impl MailboxMessage {
    pub fn encode(&self) -> Vec<u8> {
        match self {
            MailboxMessage::Task {
                task_id,
                result_slot,
            } => {
                let mut out = Vec::with_capacity(1 + 16);
                out.push(MSG_TASK);
                out.extend_from_slice(&task_id.to_le_bytes());
                out.extend_from_slice(&result_slot.to_le_bytes());
                out
            }
            MailboxMessage::Actor {
                signature,
                to,
                from,
                kind,
                message,
            } => {
                debug_assert_eq!(signature.len(), SIGNATURE_LEN);
                let mut out = Vec::with_capacity(
                    1 + SIGNATURE_LEN + 32 + to.len() + from.len() + kind.len() + message.len(),
                );
                out.push(MSG_ACTOR);
                out.extend_from_slice(signature.as_bytes());
                for part in [to, from, kind, message] {
                    out.extend_from_slice(&(part.len() as u64).to_le_bytes());
                }
                for part in [to, from, kind, message] {
                    out.extend_from_slice(part.as_bytes());
                }
                out
            }
            MailboxMessage::Tick => vec![MSG_TICK],
        }
    }

    pub fn decode(data: &[u8]) -> Option<MailboxMessage> {
        match *data.first()? {
            MSG_TASK => {
                let task_id = u64::from_le_bytes(data.get(1..9)?.try_into().ok()?);
                let result_slot = u64::from_le_bytes(data.get(9..17)?.try_into().ok()?);
                Some(MailboxMessage::Task {
                    task_id,
                    result_slot,
                })
            }
            MSG_ACTOR => {
                let signature =
                    String::from_utf8(data.get(1..1 + SIGNATURE_LEN)?.to_vec()).ok()?;
                let mut lengths = [0usize; 4];
                let mut off = 1 + SIGNATURE_LEN;
                for len in lengths.iter_mut() {
                    *len = u64::from_le_bytes(data.get(off..off + 8)?.try_into().ok()?) as usize;
                    off += 8;
                }
                let mut parts = Vec::with_capacity(4);
                for len in lengths {
                    parts.push(String::from_utf8(data.get(off..off + len)?.to_vec()).ok()?);
                    off += len;
                }
                let [to, from, kind, message]: [String; 4] = parts.try_into().ok()?;
                Some(MailboxMessage::Actor {
                    signature,
                    to,
                    from,
                    kind,
                    message,
                })
            }
            MSG_TICK => Some(MailboxMessage::Tick),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn task_layout_is_seventeen_le_bytes() {
        let msg = MailboxMessage::Task {
            task_id: 0x0102030405060708,
            result_slot: 42,
        };
        let bytes = msg.encode();
        assert_eq!(bytes.len(), 17);
        assert_eq!(bytes[0], MSG_TASK);
        assert_eq!(&bytes[1..9], &[8, 7, 6, 5, 4, 3, 2, 1]);
        assert_eq!(MailboxMessage::decode(&bytes), Some(msg));
    }

    #[test]
    fn actor_layout_round_trips() {
        let msg = MailboxMessage::Actor {
            signature: "ab".repeat(32),
            to: "<h 80 0 a>".into(),
            from: "<h 80 1 b>".into(),
            kind: "ping".into(),
            message: "payload".into(),
        };
        let bytes = msg.encode();
        assert_eq!(bytes[0], MSG_ACTOR);
        // to_len sits right after the fixed-size hex signature
        assert_eq!(bytes[65], 10);
        assert_eq!(MailboxMessage::decode(&bytes), Some(msg));
    }

    #[test]
    fn tick_is_a_single_byte() {
        assert_eq!(MailboxMessage::Tick.encode(), vec![3]);
        assert_eq!(MailboxMessage::decode(&[3]), Some(MailboxMessage::Tick));
    }

    #[test]
    fn truncated_messages_decode_to_none() {
        assert_eq!(MailboxMessage::decode(&[]), None);
        assert_eq!(MailboxMessage::decode(&[MSG_TASK, 1, 2]), None);
        let mut actor = MailboxMessage::Actor {
            signature: "0".repeat(64),
            to: "x".into(),
            from: "y".into(),
            kind: "k".into(),
            message: "m".into(),
        }
        .encode();
        actor.truncate(actor.len() - 1);
        assert_eq!(MailboxMessage::decode(&actor), None);
    }
}

//! # Parameter Table Module
//!
//! Typed key/value store for every negotiated test parameter, and the
//! `Request` message that ships the negotiated values to the server at the
//! start of each test.
//!
//! ## Set / use / validate
//!
//! Every parameter carries a `set` bit (a user supplied it) and a `used` bit
//! (a driver consumed it). Drivers read parameters through the `take_*`
//! accessors, which mark the entry used; after driver setup, `validate()`
//! fails on any parameter that was set but never used, which is how a user
//! asking for, say, `--rd-atomic` on a TCP test gets a clear "parameter not
//! applicable to this test" error instead of silence.
//!
//! ## Local / remote pairing
//!
//! Each parameter exists in a local view and a remote view. A bare name set
//! from the CLI lands in both; an `L_`- or `R_`-prefixed name targets one
//! side. The client ships its remote view inside the REQUEST and the server
//! adopts the received values as both of its views, so the two endpoints
//! agree on the effective configuration without a second negotiation pass.

use crate::wire::{Decoder, Encoder};
use thiserror::Error;

/// Wire protocol version. Advanced only on breaking change; additive fields
/// go at the end of the request with a minor bump.
pub const VER_MAJ: u16 = 1;
pub const VER_MIN: u16 = 0;
pub const VER_INC: u16 = 0;

/// Width of the fixed-length identifier and rate string fields.
pub const STR_LEN: usize = 64;

/// Sentinel for "no processor affinity requested".
pub const NO_AFFINITY: u32 = u32::MAX;

/// Which view of a paired parameter to address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Local = 0,
    Remote = 1,
}

/// Identifies one recognized parameter. The discriminant order is also the
/// stable declaration order of the u32 fields on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamId {
    AccessRecv,
    Affinity,
    AltPort,
    Flip,
    MsgSize,
    MtuSize,
    NoMsgs,
    PollMode,
    Port,
    RdAtomic,
    SockBufSize,
    Time,
    Timeout,
    Id,
    StaticRate,
}

/// The numeric parameters, in wire order.
const NUM_PARAMS: &[ParamId] = &[
    ParamId::AccessRecv,
    ParamId::Affinity,
    ParamId::AltPort,
    ParamId::Flip,
    ParamId::MsgSize,
    ParamId::MtuSize,
    ParamId::NoMsgs,
    ParamId::PollMode,
    ParamId::Port,
    ParamId::RdAtomic,
    ParamId::SockBufSize,
    ParamId::Time,
    ParamId::Timeout,
];

/// The string parameters, in wire order.
const STR_PARAMS: &[ParamId] = &[ParamId::Id, ParamId::StaticRate];

#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Num(u32),
    Str(String),
}

impl Value {
    fn as_num(&self) -> u32 {
        match self {
            Value::Num(v) => *v,
            Value::Str(_) => 0,
        }
    }

    fn as_str(&self) -> &str {
        match self {
            Value::Num(_) => "",
            Value::Str(s) => s,
        }
    }
}

impl std::fmt::Display for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Value::Num(v) => write!(f, "{}", v),
            Value::Str(s) => write!(f, "{}", s),
        }
    }
}

#[derive(Debug, Error)]
pub enum ParamError {
    #[error("unknown parameter: {0}")]
    Unknown(String),

    #[error("invalid value for {name}: {value}")]
    BadValue { name: String, value: String },

    #[error("parameter {0} not applicable to this test")]
    NotApplicable(&'static str),
}

#[derive(Debug, Clone)]
struct Entry {
    id: ParamId,
    name: &'static str,
    val: [Value; 2],
    set: [bool; 2],
    used: bool,
}

/// Per-test parameter table.
///
/// Cloned from the CLI-populated base table at the start of every test so
/// that driver defaults and used bits never leak across runs.
#[derive(Debug, Clone)]
pub struct ParamTable {
    entries: Vec<Entry>,
}

impl Default for ParamTable {
    fn default() -> Self {
        Self::new()
    }
}

impl ParamTable {
    pub fn new() -> Self {
        let num = |id, name, def: u32| Entry {
            id,
            name,
            val: [Value::Num(def), Value::Num(def)],
            set: [false, false],
            used: false,
        };
        let st = |id, name| Entry {
            id,
            name,
            val: [Value::Str(String::new()), Value::Str(String::new())],
            set: [false, false],
            used: false,
        };
        Self {
            entries: vec![
                num(ParamId::AccessRecv, "access_recv", 0),
                num(ParamId::Affinity, "affinity", NO_AFFINITY),
                num(ParamId::AltPort, "alt_port", 0),
                num(ParamId::Flip, "flip", 0),
                num(ParamId::MsgSize, "msg_size", 0),
                num(ParamId::MtuSize, "mtu_size", 0),
                num(ParamId::NoMsgs, "no_msgs", 0),
                num(ParamId::PollMode, "poll_mode", 0),
                num(ParamId::Port, "port", 0),
                num(ParamId::RdAtomic, "rd_atomic", 4),
                num(ParamId::SockBufSize, "sock_buf_size", 0),
                num(ParamId::Time, "time", 2),
                num(ParamId::Timeout, "timeout", 5),
                st(ParamId::Id, "id"),
                st(ParamId::StaticRate, "static_rate"),
            ],
        }
    }

    fn entry(&self, id: ParamId) -> &Entry {
        self.entries.iter().find(|e| e.id == id).unwrap()
    }

    fn entry_mut(&mut self, id: ParamId) -> &mut Entry {
        self.entries.iter_mut().find(|e| e.id == id).unwrap()
    }

    /// Set a driver default. Has no effect on a view the user already set.
    pub fn set_default(&mut self, id: ParamId, value: Value) {
        let e = self.entry_mut(id);
        for side in 0..2 {
            if !e.set[side] {
                e.val[side] = value.clone();
            }
        }
    }

    /// Set a parameter from user input. A bare name addresses both views, an
    /// `L_` or `R_` prefix addresses one.
    pub fn set_by_user(&mut self, name: &str, value: &str) -> Result<(), ParamError> {
        let (bare, sides): (&str, &[usize]) = if let Some(rest) = name.strip_prefix("L_") {
            (rest, &[0])
        } else if let Some(rest) = name.strip_prefix("R_") {
            (rest, &[1])
        } else {
            (name, &[0, 1])
        };

        let e = self
            .entries
            .iter_mut()
            .find(|e| e.name == bare)
            .ok_or_else(|| ParamError::Unknown(name.to_string()))?;

        let parsed = match e.val[0] {
            Value::Num(_) => Value::Num(parse_size(value).ok_or_else(|| ParamError::BadValue {
                name: name.to_string(),
                value: value.to_string(),
            })?),
            Value::Str(_) => Value::Str(value.to_string()),
        };

        for &side in sides {
            e.val[side] = parsed.clone();
            e.set[side] = true;
        }
        Ok(())
    }

    /// Look up a parameter for display (`--show-param`).
    pub fn show(&self, name: &str) -> Result<String, ParamError> {
        let bare = name
            .strip_prefix("L_")
            .or_else(|| name.strip_prefix("R_"))
            .unwrap_or(name);
        let side = if name.starts_with("R_") { 1 } else { 0 };
        let e = self
            .entries
            .iter()
            .find(|e| e.name == bare)
            .ok_or_else(|| ParamError::Unknown(name.to_string()))?;
        Ok(format!("{} = {}", name, e.val[side]))
    }

    /// Read the local view of a numeric parameter, marking it used.
    pub fn take_u32(&mut self, id: ParamId) -> u32 {
        let e = self.entry_mut(id);
        e.used = true;
        e.val[Side::Local as usize].as_num()
    }

    /// Read the local view of a string parameter, marking it used.
    pub fn take_str(&mut self, id: ParamId) -> String {
        let e = self.entry_mut(id);
        e.used = true;
        e.val[Side::Local as usize].as_str().to_string()
    }

    /// Peek a numeric parameter without touching the used bit.
    pub fn peek_u32(&self, id: ParamId) -> u32 {
        self.entry(id).val[Side::Local as usize].as_num()
    }

    /// Mark a parameter consumed without reading it. Used by drivers that
    /// honor a parameter on the peer side only.
    pub fn mark_used(&mut self, id: ParamId) {
        self.entry_mut(id).used = true;
    }

    /// Fail on any parameter the user set that no driver consumed.
    pub fn validate(&self) -> Result<(), ParamError> {
        for e in &self.entries {
            if (e.set[0] || e.set[1]) && !e.used {
                return Err(ParamError::NotApplicable(e.name));
            }
        }
        Ok(())
    }

    /// Build the REQUEST for a given test from the remote view.
    pub fn to_request(&self, test_index: u16) -> Request {
        let r = Side::Remote as usize;
        let num = |id: ParamId| self.entry(id).val[r].as_num();
        let st = |id: ParamId| self.entry(id).val[r].as_str().to_string();
        Request {
            ver_maj: VER_MAJ,
            ver_min: VER_MIN,
            ver_inc: VER_INC,
            req_index: test_index,
            access_recv: num(ParamId::AccessRecv),
            affinity: num(ParamId::Affinity),
            alt_port: num(ParamId::AltPort),
            flip: num(ParamId::Flip),
            msg_size: num(ParamId::MsgSize),
            mtu_size: num(ParamId::MtuSize),
            no_msgs: num(ParamId::NoMsgs),
            poll_mode: num(ParamId::PollMode),
            port: num(ParamId::Port),
            rd_atomic: num(ParamId::RdAtomic),
            sock_buf_size: num(ParamId::SockBufSize),
            time: num(ParamId::Time),
            timeout: num(ParamId::Timeout),
            id: st(ParamId::Id),
            static_rate: st(ParamId::StaticRate),
        }
    }

    /// Adopt a received REQUEST: its values become both views on this side,
    /// with the set bit raised on every non-default field so that validation
    /// still catches inapplicable parameters on the server.
    pub fn adopt_request(&mut self, req: &Request) {
        let defaults = ParamTable::new();
        let mut put = |id: ParamId, v: Value| {
            let def = defaults.entry(id).val[0].clone();
            let e = self.entry_mut(id);
            let set = v != def;
            e.val = [v.clone(), v];
            e.set = [set, set];
            e.used = false;
        };
        put(ParamId::AccessRecv, Value::Num(req.access_recv));
        put(ParamId::Affinity, Value::Num(req.affinity));
        put(ParamId::AltPort, Value::Num(req.alt_port));
        put(ParamId::Flip, Value::Num(req.flip));
        put(ParamId::MsgSize, Value::Num(req.msg_size));
        put(ParamId::MtuSize, Value::Num(req.mtu_size));
        put(ParamId::NoMsgs, Value::Num(req.no_msgs));
        put(ParamId::PollMode, Value::Num(req.poll_mode));
        put(ParamId::Port, Value::Num(req.port));
        put(ParamId::RdAtomic, Value::Num(req.rd_atomic));
        put(ParamId::SockBufSize, Value::Num(req.sock_buf_size));
        put(ParamId::Time, Value::Num(req.time));
        put(ParamId::Timeout, Value::Num(req.timeout));
        put(ParamId::Id, Value::Str(req.id.clone()));
        put(ParamId::StaticRate, Value::Str(req.static_rate.clone()));
    }
}

/// Parse a numeric option, accepting `k`/`m`/`g` binary suffixes the way the
/// message-size flags are commonly written (`64k`, `1m`).
pub fn parse_size(s: &str) -> Option<u32> {
    let s = s.trim();
    if s.is_empty() {
        return None;
    }
    let (num, mult) = match s.as_bytes()[s.len() - 1].to_ascii_lowercase() {
        b'k' => (&s[..s.len() - 1], 1024u64),
        b'm' => (&s[..s.len() - 1], 1024 * 1024),
        b'g' => (&s[..s.len() - 1], 1024 * 1024 * 1024),
        _ => (s, 1),
    };
    let v: u64 = num.parse().ok()?;
    u32::try_from(v.checked_mul(mult)?).ok()
}

/// The request sent once, client to server, at the start of every test.
///
/// Fixed wire layout: the 16-bit version triple and test index, thirteen
/// u32 parameters in stable declaration order, then the two 64-byte strings.
#[derive(Debug, Clone, PartialEq)]
pub struct Request {
    pub ver_maj: u16,
    pub ver_min: u16,
    pub ver_inc: u16,
    pub req_index: u16,
    pub access_recv: u32,
    pub affinity: u32,
    pub alt_port: u32,
    pub flip: u32,
    pub msg_size: u32,
    pub mtu_size: u32,
    pub no_msgs: u32,
    pub poll_mode: u32,
    pub port: u32,
    pub rd_atomic: u32,
    pub sock_buf_size: u32,
    pub time: u32,
    pub timeout: u32,
    pub id: String,
    pub static_rate: String,
}

impl Request {
    /// Exact wire length: 4 u16 fields, 13 u32 fields, 2 strings.
    pub const WIRE_LEN: usize = 4 * 2 + NUM_PARAMS.len() * 4 + STR_PARAMS.len() * STR_LEN;

    pub fn encode(&self) -> Vec<u8> {
        let mut enc = Encoder::with_capacity(Self::WIRE_LEN);
        enc.put_int(u64::from(self.ver_maj), 2);
        enc.put_int(u64::from(self.ver_min), 2);
        enc.put_int(u64::from(self.ver_inc), 2);
        enc.put_int(u64::from(self.req_index), 2);
        for &v in &[
            self.access_recv,
            self.affinity,
            self.alt_port,
            self.flip,
            self.msg_size,
            self.mtu_size,
            self.no_msgs,
            self.poll_mode,
            self.port,
            self.rd_atomic,
            self.sock_buf_size,
            self.time,
            self.timeout,
        ] {
            enc.put_int(u64::from(v), 4);
        }
        enc.put_str(&self.id, STR_LEN);
        enc.put_str(&self.static_rate, STR_LEN);
        let bytes = enc.finish();
        debug_assert_eq!(bytes.len(), Self::WIRE_LEN);
        bytes
    }

    /// Decode a request. Trailing bytes beyond the known layout are ignored,
    /// which is how additive minor-version fields stay compatible.
    pub fn decode(bytes: &[u8]) -> Result<Self, crate::wire::WireError> {
        let mut dec = Decoder::new(bytes);
        Ok(Self {
            ver_maj: dec.get_u16()?,
            ver_min: dec.get_u16()?,
            ver_inc: dec.get_u16()?,
            req_index: dec.get_u16()?,
            access_recv: dec.get_u32()?,
            affinity: dec.get_u32()?,
            alt_port: dec.get_u32()?,
            flip: dec.get_u32()?,
            msg_size: dec.get_u32()?,
            mtu_size: dec.get_u32()?,
            no_msgs: dec.get_u32()?,
            poll_mode: dec.get_u32()?,
            port: dec.get_u32()?,
            rd_atomic: dec.get_u32()?,
            sock_buf_size: dec.get_u32()?,
            time: dec.get_u32()?,
            timeout: dec.get_u32()?,
            id: dec.get_str(STR_LEN)?,
            static_rate: dec.get_str(STR_LEN)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_round_trip() {
        let mut table = ParamTable::new();
        table.set_by_user("msg_size", "64k").unwrap();
        table.set_by_user("time", "10").unwrap();
        table.set_by_user("id", "mlx5_0:2").unwrap();
        let req = table.to_request(7);

        let bytes = req.encode();
        assert_eq!(bytes.len(), Request::WIRE_LEN);
        let back = Request::decode(&bytes).unwrap();
        assert_eq!(back, req);
        assert_eq!(back.msg_size, 65536);
        assert_eq!(back.req_index, 7);
        assert_eq!(back.id, "mlx5_0:2");
    }

    /// Additive fields from a newer minor version decode cleanly.
    #[test]
    fn test_request_ignores_trailing_bytes() {
        let table = ParamTable::new();
        let mut bytes = table.to_request(0).encode();
        bytes.extend_from_slice(&[0xaa; 12]);
        let back = Request::decode(&bytes).unwrap();
        assert_eq!(back.req_index, 0);
    }

    #[test]
    fn test_set_use_validate() {
        let mut table = ParamTable::new();
        table.set_by_user("sock_buf_size", "131072").unwrap();

        // Set but unused: validation must fail.
        let err = table.validate().unwrap_err();
        assert!(matches!(err, ParamError::NotApplicable("sock_buf_size")));

        // Consumed by a driver: validation passes.
        assert_eq!(table.take_u32(ParamId::SockBufSize), 131072);
        table.validate().unwrap();
    }

    #[test]
    fn test_local_remote_views() {
        let mut table = ParamTable::new();
        table.set_by_user("L_msg_size", "1024").unwrap();
        table.set_by_user("R_msg_size", "2048").unwrap();

        assert_eq!(table.peek_u32(ParamId::MsgSize), 1024);
        // The request carries the remote view.
        assert_eq!(table.to_request(0).msg_size, 2048);
    }

    #[test]
    fn test_defaults_do_not_override_user_values() {
        let mut table = ParamTable::new();
        table.set_by_user("msg_size", "512").unwrap();
        table.set_default(ParamId::MsgSize, Value::Num(65536));
        assert_eq!(table.peek_u32(ParamId::MsgSize), 512);

        let mut table = ParamTable::new();
        table.set_default(ParamId::MsgSize, Value::Num(65536));
        assert_eq!(table.peek_u32(ParamId::MsgSize), 65536);
    }

    #[test]
    fn test_adopt_request_marks_set_fields() {
        let mut client = ParamTable::new();
        client.set_by_user("no_msgs", "100").unwrap();
        let req = client.to_request(3);

        let mut server = ParamTable::new();
        server.adopt_request(&req);
        assert_eq!(server.peek_u32(ParamId::NoMsgs), 100);

        // The adopted non-default value must trip validation if unused.
        assert!(server.validate().is_err());
        server.mark_used(ParamId::NoMsgs);
        server.validate().unwrap();
    }

    #[test]
    fn test_unknown_parameter() {
        let mut table = ParamTable::new();
        assert!(matches!(
            table.set_by_user("bogus", "1"),
            Err(ParamError::Unknown(_))
        ));
    }

    #[test]
    fn test_parse_size_suffixes() {
        assert_eq!(parse_size("64k"), Some(65536));
        assert_eq!(parse_size("2m"), Some(2 * 1024 * 1024));
        assert_eq!(parse_size("1g"), Some(1024 * 1024 * 1024));
        assert_eq!(parse_size("123"), Some(123));
        assert_eq!(parse_size(""), None);
        assert_eq!(parse_size("12q"), None);
    }
}

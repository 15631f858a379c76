use serde_derive::Deserialize;
use std::collections::HashMap;

/// Well-known option names. Scoped lookups walk connection → listen socket →
/// global → compiled default.
pub mod opt {
    pub const TIMEOUT_INITIAL: &str = "Timeout_Initial";
    pub const TIMEOUT_CONNECTED: &str = "Timeout_Connected";
    pub const SEND_BUFFER_SIZE: &str = "SendBufferSize";
    pub const SEND_RATE_MIN: &str = "SendRateMin";
    pub const SEND_RATE_MAX: &str = "SendRateMax";
    pub const NAGLE_TIME: &str = "NagleTime";
    pub const LOG_LEVEL_P2P_RENDEZVOUS: &str = "LogLevel_P2PRendezvous";
    pub const IP_ALLOW_WITHOUT_AUTH: &str = "IP_AllowWithoutAuth";
    pub const P2P_STUN_SERVER_LIST: &str = "P2P_STUN_ServerList";
    pub const SYMMETRIC_CONNECT: &str = "SymmetricConnect";
    pub const LOCAL_VIRTUAL_PORT: &str = "LocalVirtualPort";
    pub const MTU_PACKET_SIZE: &str = "MTU_PacketSize";
    pub const CALLBACK_CONNECTION_STATUS_CHANGED: &str = "Callback_ConnectionStatusChanged";
}

#[derive(Debug, Clone, PartialEq)]
pub enum ConfigValue {
    Int(i64),
    Float(f64),
    Bool(bool),
    Str(String),
    /// Opaque function pointer carried as its address. Zero means unset.
    /// The typed registration API installs the actual closure; this slot
    /// exists so callback options resolve through the same scope chain.
    FnPtr(usize),
}

impl ConfigValue {
    #[inline]
    pub fn as_int(&self) -> Option<i64> {
        match self {
            ConfigValue::Int(v) => Some(*v),
            ConfigValue::Bool(v) => Some(*v as i64),
            _ => None,
        }
    }

    #[inline]
    pub fn as_float(&self) -> Option<f64> {
        match self {
            ConfigValue::Float(v) => Some(*v),
            ConfigValue::Int(v) => Some(*v as f64),
            _ => None,
        }
    }

    #[inline]
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            ConfigValue::Bool(v) => Some(*v),
            ConfigValue::Int(v) => Some(*v != 0),
            _ => None,
        }
    }

    #[inline]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            ConfigValue::Str(v) => Some(v),
            _ => None,
        }
    }

    #[inline]
    pub fn as_fn_ptr(&self) -> Option<usize> {
        match self {
            ConfigValue::FnPtr(v) => Some(*v),
            _ => None,
        }
    }
}

/// Compiled defaults for every recognized option.
fn default(name: &str) -> Option<ConfigValue> {
    Some(match name {
        opt::TIMEOUT_INITIAL => ConfigValue::Int(10_000),
        opt::TIMEOUT_CONNECTED => ConfigValue::Int(10_000),
        opt::SEND_BUFFER_SIZE => ConfigValue::Int(512 * 1024),
        opt::SEND_RATE_MIN => ConfigValue::Int(16_384),
        opt::SEND_RATE_MAX => ConfigValue::Int(131_072),
        opt::NAGLE_TIME => ConfigValue::Int(5_000),
        opt::LOG_LEVEL_P2P_RENDEZVOUS => ConfigValue::Int(1),
        opt::IP_ALLOW_WITHOUT_AUTH => ConfigValue::Bool(false),
        opt::P2P_STUN_SERVER_LIST => ConfigValue::Str(String::new()),
        opt::SYMMETRIC_CONNECT => ConfigValue::Bool(false),
        opt::LOCAL_VIRTUAL_PORT => ConfigValue::Int(0),
        opt::MTU_PACKET_SIZE => ConfigValue::Int(1200),
        opt::CALLBACK_CONNECTION_STATUS_CHANGED => ConfigValue::FnPtr(0),
        _ => return None,
    })
}

/// A sparse bag of option overrides at one scope.
#[derive(Debug, Clone, Default)]
pub struct ConfigStore {
    values: HashMap<String, ConfigValue>,
}

impl ConfigStore {
    #[inline]
    pub fn new() -> ConfigStore {
        ConfigStore {
            values: HashMap::new(),
        }
    }

    /// Sets an override. Returns false for unrecognized option names.
    pub fn set(&mut self, name: &str, value: ConfigValue) -> bool {
        if default(name).is_none() {
            return false;
        }

        self.values.insert(name.to_owned(), value);
        true
    }

    #[inline]
    pub fn get(&self, name: &str) -> Option<&ConfigValue> {
        self.values.get(name)
    }

    #[inline]
    pub fn clear(&mut self, name: &str) {
        self.values.remove(name);
    }
}

/// A resolved view over the scope chain. Holds references to the stores in
/// resolution order, most specific first.
pub struct ConfigView<'a> {
    chain: [Option<&'a ConfigStore>; 3],
}

impl<'a> ConfigView<'a> {
    #[inline]
    pub fn new(
        connection: Option<&'a ConfigStore>,
        listen_socket: Option<&'a ConfigStore>,
        global: Option<&'a ConfigStore>,
    ) -> ConfigView<'a> {
        ConfigView {
            chain: [connection, listen_socket, global],
        }
    }

    pub fn resolve(&self, name: &str) -> Option<ConfigValue> {
        for store in self.chain.iter().flatten() {
            if let Some(value) = store.get(name) {
                return Some(value.clone());
            }
        }

        default(name)
    }

    /// Integer lookup; panics on unknown option names, which indicate a typo
    /// at the call site rather than a runtime condition.
    #[inline]
    pub fn int(&self, name: &str) -> i64 {
        self.resolve(name)
            .and_then(|v| v.as_int())
            .unwrap_or_else(|| panic!("Unknown or mistyped int option: {}", name))
    }

    #[inline]
    pub fn boolean(&self, name: &str) -> bool {
        self.resolve(name)
            .and_then(|v| v.as_bool())
            .unwrap_or_else(|| panic!("Unknown or mistyped bool option: {}", name))
    }

    #[inline]
    pub fn string(&self, name: &str) -> String {
        self.resolve(name)
            .and_then(|v| v.as_str().map(ToOwned::to_owned))
            .unwrap_or_else(|| panic!("Unknown or mistyped string option: {}", name))
    }

    #[inline]
    pub fn fn_ptr(&self, name: &str) -> usize {
        self.resolve(name)
            .and_then(|v| v.as_fn_ptr())
            .unwrap_or_else(|| panic!("Unknown or mistyped fn-ptr option: {}", name))
    }
}

/// On-disk form for bulk configuration, loaded with serdeconv from TOML.
#[derive(Debug, Default, Deserialize)]
pub struct ConfigFile {
    pub timeout_initial_ms: Option<i64>,
    pub timeout_connected_ms: Option<i64>,
    pub send_buffer_size: Option<i64>,
    pub send_rate_min: Option<i64>,
    pub send_rate_max: Option<i64>,
    pub nagle_time_us: Option<i64>,
    pub stun_server_list: Option<String>,
    pub allow_without_auth: Option<bool>,
}

impl ConfigFile {
    pub fn from_toml_str(text: &str) -> Result<ConfigFile, serdeconv::Error> {
        serdeconv::from_toml_str(text)
    }

    /// Applies every present field onto a store.
    pub fn apply(&self, store: &mut ConfigStore) {
        if let Some(v) = self.timeout_initial_ms {
            store.set(opt::TIMEOUT_INITIAL, ConfigValue::Int(v));
        }
        if let Some(v) = self.timeout_connected_ms {
            store.set(opt::TIMEOUT_CONNECTED, ConfigValue::Int(v));
        }
        if let Some(v) = self.send_buffer_size {
            store.set(opt::SEND_BUFFER_SIZE, ConfigValue::Int(v));
        }
        if let Some(v) = self.send_rate_min {
            store.set(opt::SEND_RATE_MIN, ConfigValue::Int(v));
        }
        if let Some(v) = self.send_rate_max {
            store.set(opt::SEND_RATE_MAX, ConfigValue::Int(v));
        }
        if let Some(v) = self.nagle_time_us {
            store.set(opt::NAGLE_TIME, ConfigValue::Int(v));
        }
        if let Some(v) = &self.stun_server_list {
            store.set(opt::P2P_STUN_SERVER_LIST, ConfigValue::Str(v.clone()));
        }
        if let Some(v) = self.allow_without_auth {
            store.set(opt::IP_ALLOW_WITHOUT_AUTH, ConfigValue::Bool(v));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_resolve() {
        let view = ConfigView::new(None, None, None);

        assert_eq!(view.int(opt::TIMEOUT_INITIAL), 10_000);
        assert_eq!(view.int(opt::SEND_RATE_MAX), 131_072);
        assert!(!view.boolean(opt::IP_ALLOW_WITHOUT_AUTH));
        assert_eq!(view.string(opt::P2P_STUN_SERVER_LIST), "");
    }

    #[test]
    fn test_scope_precedence() {
        let mut global = ConfigStore::new();
        let mut listen = ConfigStore::new();
        let mut conn = ConfigStore::new();

        global.set(opt::TIMEOUT_INITIAL, ConfigValue::Int(1));
        listen.set(opt::TIMEOUT_INITIAL, ConfigValue::Int(2));
        conn.set(opt::TIMEOUT_INITIAL, ConfigValue::Int(3));

        let view = ConfigView::new(Some(&conn), Some(&listen), Some(&global));
        assert_eq!(view.int(opt::TIMEOUT_INITIAL), 3);

        let view = ConfigView::new(None, Some(&listen), Some(&global));
        assert_eq!(view.int(opt::TIMEOUT_INITIAL), 2);

        let view = ConfigView::new(None, None, Some(&global));
        assert_eq!(view.int(opt::TIMEOUT_INITIAL), 1);
    }

    #[test]
    fn test_unknown_name_rejected() {
        let mut store = ConfigStore::new();
        assert!(!store.set("NotAnOption", ConfigValue::Int(1)));
        assert!(store.set(opt::NAGLE_TIME, ConfigValue::Int(1)));
    }

    #[test]
    fn test_fn_ptr_option() {
        let view = ConfigView::new(None, None, None);
        assert_eq!(view.fn_ptr(opt::CALLBACK_CONNECTION_STATUS_CHANGED), 0);

        let mut store = ConfigStore::new();
        assert!(store.set(
            opt::CALLBACK_CONNECTION_STATUS_CHANGED,
            ConfigValue::FnPtr(0xDEAD),
        ));

        let view = ConfigView::new(None, None, Some(&store));
        assert_eq!(view.fn_ptr(opt::CALLBACK_CONNECTION_STATUS_CHANGED), 0xDEAD);

        // Type confusion never resolves silently
        assert_eq!(
            ConfigValue::FnPtr(7).as_int(),
            None
        );
        assert_eq!(ConfigValue::Int(7).as_fn_ptr(), None);
    }

    #[test]
    fn test_toml_loading() {
        let file = ConfigFile::from_toml_str(
            r#"
timeout_initial_ms = 2500
stun_server_list = "stun.example:3478"
allow_without_auth = true
"#,
        )
        .unwrap();

        let mut store = ConfigStore::new();
        file.apply(&mut store);

        let view = ConfigView::new(None, None, Some(&store));
        assert_eq!(view.int(opt::TIMEOUT_INITIAL), 2500);
        assert_eq!(view.string(opt::P2P_STUN_SERVER_LIST), "stun.example:3478");
        assert!(view.boolean(opt::IP_ALLOW_WITHOUT_AUTH));
    }
}

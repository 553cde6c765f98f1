use std::collections::HashMap;

use regex::Regex;

use clawdis_protocol::{
    ClientDescriptor, PRESENCE_MAX_ENTRIES, PRESENCE_TTL_MS, PresenceEntry, now_ms,
};

/// Structured system-event text of the form
/// `Node: <host> (<ip>) · app <ver> · last input <n>s ago · mode <m> · reason <r>`.
static NODE_LINE: std::sync::LazyLock<Regex> = std::sync::LazyLock::new(|| {
    Regex::new(
        r"^Node:\s*(?<host>.+?)\s*\((?<ip>[^)]+)\)\s*·\s*app\s+(?<version>\S+)\s*·\s*last input\s+(?<secs>\d+)s ago\s*·\s*mode\s+(?<mode>\S+)\s*·\s*reason\s+(?<reason>\S+)\s*$",
    )
    .unwrap_or_else(|e| panic!("node line pattern must be valid regex: {e}"))
});

/// In-memory TTL map of known nodes with a monotonic version counter.
///
/// Keys: `instanceId` (if provided) else `connId` for client-induced entries,
/// lowercase hostname for the self entry and for parsed node lines.
pub struct PresenceRegistry {
    entries: HashMap<String, PresenceEntry>,
    version: u64,
    host: String,
    self_key: String,
    app_version: String,
    ttl_ms: u64,
    max_entries: usize,
}

impl PresenceRegistry {
    pub fn new(host: impl Into<String>, app_version: impl Into<String>) -> Self {
        let host = host.into();
        Self {
            entries: HashMap::new(),
            version: 0,
            self_key: host.to_lowercase(),
            host,
            app_version: app_version.into(),
            ttl_ms: PRESENCE_TTL_MS,
            max_entries: PRESENCE_MAX_ENTRIES,
        }
    }

    /// Monotonic counter, bumped on every externally visible mutation.
    pub fn version(&self) -> u64 {
        self.version
    }

    /// Synthesize a `connect` entry for a freshly accepted client. Returns
    /// the registry key so the connection can mark its disconnect later.
    pub fn record_connect(&mut self, descriptor: &ClientDescriptor, conn_id: &str) -> String {
        self.record_connect_at(descriptor, conn_id, now_ms())
    }

    fn record_connect_at(
        &mut self,
        descriptor: &ClientDescriptor,
        conn_id: &str,
        now: u64,
    ) -> String {
        let key = descriptor
            .instance_id
            .clone()
            .unwrap_or_else(|| conn_id.to_string());
        self.entries.insert(key.clone(), PresenceEntry {
            host: Some(self.host.clone()),
            version: Some(self.app_version.clone()),
            mode: Some(descriptor.mode.clone()),
            reason: Some("connect".into()),
            ts: now,
            instance_id: descriptor.instance_id.clone(),
            ..PresenceEntry::default()
        });
        self.version += 1;
        key
    }

    /// Flip an entry to `disconnect`. The entry stays until the TTL takes it.
    pub fn record_disconnect(&mut self, key: &str) {
        self.record_disconnect_at(key, now_ms());
    }

    fn record_disconnect_at(&mut self, key: &str, now: u64) {
        if let Some(entry) = self.entries.get_mut(key) {
            entry.reason = Some("disconnect".into());
            entry.ts = now;
            self.version += 1;
        }
    }

    /// Append or refresh an entry from free-form system-event text. The
    /// structured node-line form is parsed; anything else is preserved whole.
    pub fn record_text(&mut self, text: &str) {
        self.record_text_at(text, now_ms());
    }

    fn record_text_at(&mut self, text: &str, now: u64) {
        let entry = match NODE_LINE.captures(text) {
            Some(caps) => PresenceEntry {
                host: Some(caps["host"].to_string()),
                ip: Some(caps["ip"].to_string()),
                version: Some(caps["version"].to_string()),
                mode: Some(caps["mode"].to_string()),
                last_input_seconds: caps["secs"].parse().ok(),
                reason: Some(caps["reason"].to_string()),
                ts: now,
                ..PresenceEntry::default()
            },
            None => PresenceEntry {
                text: Some(text.to_string()),
                ts: now,
                ..PresenceEntry::default()
            },
        };
        let key = entry
            .host
            .as_deref()
            .map(str::to_lowercase)
            .unwrap_or_else(|| text.to_string());
        self.entries.insert(key, entry);
        self.version += 1;
    }

    /// Impure read: prunes expired entries, evicts down to the cap,
    /// refreshes the self entry, and returns a stable copy sorted by `ts`
    /// descending.
    pub fn list(&mut self) -> Vec<PresenceEntry> {
        self.list_at(now_ms())
    }

    fn list_at(&mut self, now: u64) -> Vec<PresenceEntry> {
        let ttl = self.ttl_ms;
        self.entries
            .retain(|_, entry| now.saturating_sub(entry.ts) < ttl);
        self.touch_self(now);
        self.evict_over_cap();

        let mut list: Vec<PresenceEntry> = self.entries.values().cloned().collect();
        list.sort_by(|a, b| b.ts.cmp(&a.ts));
        list
    }

    fn touch_self(&mut self, now: u64) {
        let host = self.host.clone();
        let app_version = self.app_version.clone();
        let entry = self
            .entries
            .entry(self.self_key.clone())
            .or_insert_with(|| PresenceEntry {
                host: Some(host),
                version: Some(app_version),
                mode: Some("backend".into()),
                ..PresenceEntry::default()
            });
        entry.ts = now;
    }

    fn evict_over_cap(&mut self) {
        while self.entries.len() > self.max_entries {
            let Some(oldest_key) = self
                .entries
                .iter()
                .min_by_key(|(_, entry)| entry.ts)
                .map(|(k, _)| k.clone())
            else {
                break;
            };
            self.entries.remove(&oldest_key);
        }
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> PresenceRegistry {
        PresenceRegistry::new("testhost", "1.2.3")
    }

    fn descriptor(instance_id: Option<&str>) -> ClientDescriptor {
        ClientDescriptor {
            name: "t".into(),
            version: "1".into(),
            platform: "test".into(),
            mode: "cli".into(),
            instance_id: instance_id.map(Into::into),
        }
    }

    #[test]
    fn connect_entry_is_keyed_by_instance_id_when_present() {
        let mut reg = registry();
        let key = reg.record_connect_at(&descriptor(Some("inst-1")), "conn-1", 10);
        assert_eq!(key, "inst-1");
        let key = reg.record_connect_at(&descriptor(None), "conn-2", 10);
        assert_eq!(key, "conn-2");
    }

    #[test]
    fn connect_then_disconnect_flips_reason_and_bumps_version() {
        let mut reg = registry();
        let key = reg.record_connect_at(&descriptor(None), "conn-1", 10);
        let after_connect = reg.version();
        reg.record_disconnect_at(&key, 20);
        assert!(reg.version() > after_connect);

        let list = reg.list_at(30);
        let entry = list
            .iter()
            .find(|e| e.reason.as_deref() == Some("disconnect"))
            .unwrap();
        assert_eq!(entry.ts, 20);
        assert_eq!(entry.mode.as_deref(), Some("cli"));
    }

    #[test]
    fn disconnect_of_unknown_key_is_a_no_op() {
        let mut reg = registry();
        reg.record_disconnect_at("ghost", 10);
        assert_eq!(reg.version(), 0);
    }

    #[test]
    fn node_line_is_parsed_into_fields() {
        let mut reg = registry();
        reg.record_text_at(
            "Node: studio (192.168.1.7) · app 2.1.0 · last input 42s ago · mode app · reason periodic",
            50,
        );
        let list = reg.list_at(60);
        let entry = list.iter().find(|e| e.ip.is_some()).unwrap();
        assert_eq!(entry.host.as_deref(), Some("studio"));
        assert_eq!(entry.ip.as_deref(), Some("192.168.1.7"));
        assert_eq!(entry.version.as_deref(), Some("2.1.0"));
        assert_eq!(entry.last_input_seconds, Some(42));
        assert_eq!(entry.mode.as_deref(), Some("app"));
        assert_eq!(entry.reason.as_deref(), Some("periodic"));
        assert_eq!(entry.text, None);
    }

    #[test]
    fn unstructured_text_is_preserved_whole() {
        let mut reg = registry();
        reg.record_text_at("note from test", 50);
        let list = reg.list_at(60);
        let entry = list.iter().find(|e| e.text.is_some()).unwrap();
        assert_eq!(entry.text.as_deref(), Some("note from test"));
        assert_eq!(entry.host, None);
    }

    #[test]
    fn list_prunes_expired_entries_and_refreshes_self() {
        let mut reg = registry();
        reg.record_text_at("stale", 1_000);

        let list = reg.list_at(1_000 + PRESENCE_TTL_MS);
        // The stale entry aged out; the self entry is always present and fresh.
        assert_eq!(list.len(), 1);
        assert_eq!(list[0].host.as_deref(), Some("testhost"));
        assert_eq!(list[0].ts, 1_000 + PRESENCE_TTL_MS);
    }

    #[test]
    fn list_is_sorted_by_ts_descending() {
        let mut reg = registry();
        reg.record_text_at("a", 10);
        reg.record_text_at("b", 30);
        reg.record_text_at("c", 20);
        let list = reg.list_at(40);
        let ts: Vec<u64> = list.iter().map(|e| e.ts).collect();
        assert_eq!(ts, vec![40, 30, 20, 10]);
    }

    #[test]
    fn oldest_entries_are_evicted_over_the_cap() {
        let mut reg = registry();
        for i in 0..PRESENCE_MAX_ENTRIES as u64 + 10 {
            reg.record_text_at(&format!("note {i}"), i + 1);
        }
        let list = reg.list_at(PRESENCE_MAX_ENTRIES as u64 + 20);
        assert_eq!(list.len(), PRESENCE_MAX_ENTRIES);
        // The oldest notes are gone.
        assert!(!list.iter().any(|e| e.text.as_deref() == Some("note 0")));
    }

    #[test]
    fn reads_do_not_bump_the_version() {
        let mut reg = registry();
        reg.record_text_at("a", 10);
        let version = reg.version();
        reg.list_at(20);
        assert_eq!(reg.version(), version);
    }
}

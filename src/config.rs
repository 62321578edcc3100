// Pre-validated configuration model (§6.4).
//
// Parsing (JSON/YAML/whatever the deployment uses) is explicitly a Non-goal;
// what's in scope is the shape the parsed-and-validated configuration takes
// once it reaches the engine, since the server/client construction paths
// (§4, §7) take these structs directly. `serde` derives are kept so a
// deployment can plug in whatever format crate it likes upstream.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// A provided SOME/IP service instance (§4.1), as offered by this node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProvidedServiceInstance {
    pub service_id: u16,
    pub instance_id: u16,
    pub major_version: u8,
    pub minor_version: u32,
    /// Eventgroups this instance offers and their multicast options, keyed
    /// by eventgroup id.
    pub eventgroups: Vec<u16>,
}

/// A required SOME/IP service instance (§4.2), as consumed by this node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequiredServiceInstance {
    pub service_id: u16,
    pub instance_id: u16,
    pub major_version: u8,
    pub minor_version: u32,
    pub eventgroups: Vec<u16>,
}

/// Timing parameters for one provided-instance's offer lifecycle (§4.4).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct OfferTiming {
    #[serde(with = "duration_millis")]
    pub initial_delay_min: Duration,
    #[serde(with = "duration_millis")]
    pub initial_delay_max: Duration,
    #[serde(with = "duration_millis")]
    pub repetition_base_delay: Duration,
    pub repetition_max: u32,
    #[serde(with = "duration_millis")]
    pub cyclic_offer_delay: Duration,
    #[serde(with = "duration_millis")]
    pub request_response_delay_min: Duration,
    #[serde(with = "duration_millis")]
    pub request_response_delay_max: Duration,
}

impl Default for OfferTiming {
    fn default() -> Self {
        Self {
            initial_delay_min: Duration::from_millis(10),
            initial_delay_max: Duration::from_millis(100),
            repetition_base_delay: Duration::from_millis(200),
            repetition_max: 3,
            cyclic_offer_delay: Duration::from_secs(2),
            request_response_delay_min: Duration::from_millis(10),
            request_response_delay_max: Duration::from_millis(50),
        }
    }
}

/// One receiver class's quota bucket (§6.4, C6.5).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReceiverClassConfig {
    pub class_id: u32,
    pub max_slots_in_use: u32,
}

/// Configuration for a single MemCon channel (§6.1, §6.4).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemConChannelConfig {
    pub channel_name: String,
    pub num_slots: u32,
    pub slot_content_size: u32,
    pub slot_content_alignment: u32,
    pub max_receivers: u32,
    pub classes: Vec<ReceiverClassConfig>,
}

impl MemConChannelConfig {
    /// Validate the invariants §6.4 requires of a channel configuration
    /// before it is handed to `memcon::server::Server::new`.
    pub fn validate(&self) -> Result<(), String> {
        if self.num_slots == 0 {
            return Err("num_slots must be > 0".into());
        }
        if self.slot_content_alignment == 0 || !self.slot_content_alignment.is_power_of_two() {
            return Err("slot_content_alignment must be a power of two".into());
        }
        if self.max_receivers == 0 {
            return Err("max_receivers must be > 0".into());
        }
        let class_total: u64 = self.classes.iter().map(|c| c.max_slots_in_use as u64).sum();
        if class_total > self.num_slots as u64 {
            return Err(format!(
                "sum of class quotas ({class_total}) exceeds num_slots ({})",
                self.num_slots
            ));
        }
        let mut seen = std::collections::HashSet::new();
        for c in &self.classes {
            if !seen.insert(c.class_id) {
                return Err(format!("duplicate class_id {}", c.class_id));
            }
        }
        Ok(())
    }
}

/// Top-level node configuration: what this process offers, what it requires,
/// and the MemCon channels it exposes.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct NodeConfig {
    pub provided: Vec<ProvidedServiceInstance>,
    pub required: Vec<RequiredServiceInstance>,
    pub channels: Vec<MemConChannelConfig>,
}

mod duration_millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let millis = u64::deserialize(d)?;
        Ok(Duration::from_millis(millis))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_channel() -> MemConChannelConfig {
        MemConChannelConfig {
            channel_name: "audio_frames".into(),
            num_slots: 16,
            slot_content_size: 4096,
            slot_content_alignment: 64,
            max_receivers: 4,
            classes: vec![
                ReceiverClassConfig { class_id: 0, max_slots_in_use: 8 },
                ReceiverClassConfig { class_id: 1, max_slots_in_use: 4 },
            ],
        }
    }

    #[test]
    fn accepts_well_formed_channel_config() {
        assert!(valid_channel().validate().is_ok());
    }

    #[test]
    fn rejects_non_power_of_two_alignment() {
        let mut c = valid_channel();
        c.slot_content_alignment = 3;
        assert!(c.validate().is_err());
    }

    #[test]
    fn rejects_oversubscribed_class_quotas() {
        let mut c = valid_channel();
        c.classes.push(ReceiverClassConfig { class_id: 2, max_slots_in_use: 16 });
        assert!(c.validate().is_err());
    }

    #[test]
    fn rejects_duplicate_class_ids() {
        let mut c = valid_channel();
        c.classes.push(ReceiverClassConfig { class_id: 0, max_slots_in_use: 1 });
        assert!(c.validate().is_err());
    }
}

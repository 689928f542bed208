use chrono::{DateTime, Utc};

use idr_schemas::{meta, DeviceState, DeviceUpdate, Metadata, PromotionRules, SubnetPolicy};

/// Fluent builder for discovery observations.
#[derive(Debug, Clone)]
pub struct ObservationBuilder {
    update: DeviceUpdate,
}

impl ObservationBuilder {
    pub fn new(source: &str, ip: &str) -> Self {
        Self {
            update: DeviceUpdate::observed(source, "default", ip, Utc::now()),
        }
    }

    pub fn partition(mut self, partition: &str) -> Self {
        self.update.partition = partition.to_string();
        self
    }

    pub fn device_id(mut self, id: &str) -> Self {
        self.update.device_id = id.to_string();
        self
    }

    pub fn mac(mut self, mac: &str) -> Self {
        self.update.mac = Some(mac.to_string());
        self
    }

    pub fn hostname(mut self, hostname: &str) -> Self {
        self.update.hostname = Some(hostname.to_string());
        self
    }

    pub fn agent(mut self, agent_id: &str) -> Self {
        self.update.agent_id = agent_id.to_string();
        self.update
            .metadata
            .insert(meta::AGENT_ID.to_string(), agent_id.to_string());
        self
    }

    pub fn integration_id(mut self, id: &str) -> Self {
        self.update
            .metadata
            .insert(meta::INTEGRATION_ID.to_string(), id.to_string());
        self
    }

    pub fn fingerprint(mut self, hash: &str) -> Self {
        self.update
            .metadata
            .insert(meta::FINGERPRINT_HASH.to_string(), hash.to_string());
        self
    }

    pub fn meta(mut self, key: &str, value: &str) -> Self {
        self.update.metadata.insert(key.to_string(), value.to_string());
        self
    }

    pub fn at(mut self, ts: DateTime<Utc>) -> Self {
        self.update.timestamp = ts;
        self
    }

    pub fn build(self) -> DeviceUpdate {
        self.update
    }
}

/// Prior device state; `integration_id` `None` models malformed history.
pub fn device_state(device_id: &str, ip: &str, integration_id: Option<&str>) -> DeviceState {
    let mut metadata = Metadata::new();
    if let Some(id) = integration_id {
        metadata.insert(meta::INTEGRATION_ID.to_string(), id.to_string());
    }
    DeviceState {
        device_id: device_id.to_string(),
        ip: ip.to_string(),
        is_available: true,
        metadata,
    }
}

pub fn subnet_policy(subnet_id: &str, cidr: &str, rules: PromotionRules) -> SubnetPolicy {
    SubnetPolicy {
        subnet_id: subnet_id.to_string(),
        cidr: cidr.to_string(),
        classification: String::new(),
        promotion_rules: rules,
        reaper_profile: None,
        allow_ip_as_id: false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_fills_identity_fields() {
        let u = ObservationBuilder::new("armis", "10.1.0.1")
            .partition("dc1")
            .mac("aa:bb:cc:dd:ee:ff")
            .agent("agent-1")
            .integration_id("42")
            .build();
        assert_eq!(u.partition, "dc1");
        assert_eq!(u.agent_id, "agent-1");
        assert_eq!(u.integration_id(), Some("42"));
        assert_eq!(u.mac_value(), Some("aa:bb:cc:dd:ee:ff"));
        assert!(!u.is_retraction());
    }

    #[test]
    fn policy_and_state_helpers() {
        let p = subnet_policy(
            "lab",
            "10.0.0.0/8",
            PromotionRules {
                require_hostname: true,
                ..PromotionRules::default()
            },
        );
        assert!(p.promotion_rules.require_hostname);
        assert!(!p.allow_ip_as_id);
        assert_eq!(device_state("d", "10.0.0.1", None).integration_id(), None);
    }
}

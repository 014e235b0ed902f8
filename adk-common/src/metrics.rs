// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Host-populated system metrics. The host fills one of these in at
//! startup; the runtime validates the field character sets before any
//! value is used in reporting or partner-facing identifiers.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Broad device category, used for reporting context.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceClass {
    DesktopPc,
    GameConsole,
    Stb,
    Tv,
    Mobile,
    Dvr,
    MiniatureSbc,
    #[default]
    Unknown,
}

impl DeviceClass {
    /// Reporting label for the class.
    pub fn label(&self) -> &'static str {
        match self {
            DeviceClass::DesktopPc => "Desktop",
            DeviceClass::GameConsole => "Console",
            DeviceClass::Stb => "STB",
            DeviceClass::Tv => "TV",
            DeviceClass::Mobile => "MOBILE",
            DeviceClass::Dvr | DeviceClass::MiniatureSbc | DeviceClass::Unknown => "Unknown",
        }
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct SystemMetrics {
    pub core_version: String,
    pub config: String,
    pub vendor: String,
    pub partner: String,
    pub device: String,
    pub firmware: String,
    pub software: String,
    pub revision: String,
    pub gpu: String,
    pub cpu: String,
    /// Hex HMAC of the device identity material.
    pub device_id: String,
    pub device_region: String,
    /// `"prod"` in shipping builds, `"dev"` otherwise.
    pub tenancy: String,
    pub partner_guid: String,
    pub advertising_id: String,
    pub main_memory_mbytes: i32,
    pub video_memory_mbytes: i32,
    pub num_hardware_threads: i32,
    pub num_cores: i32,
    pub device_class: DeviceClass,
    /// Bitset of host texture format support.
    pub gpu_texture_formats: u32,
    pub persistent_storage_available_bytes: i64,
    pub persistent_storage_max_write_bytes_per_second: i64,
    pub persona_id: String,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum MetricsError {
    #[error("metrics field '{field}' contains invalid characters: {value:?}")]
    InvalidField { field: &'static str, value: String },
    #[error("tenancy must be \"prod\" or \"dev\", got {0:?}")]
    InvalidTenancy(String),
}

fn is_alnum_underscore(value: &str) -> bool {
    value.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'_')
}

fn is_alnum_dash(value: &str) -> bool {
    value.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'-')
}

impl SystemMetrics {
    /// Checks the partner-facing character constraints: the identity
    /// fields are alphanumeric-with-underscores, `partner_guid` is
    /// alphanumeric-with-dashes, and `tenancy` is one of the two known
    /// environments.
    pub fn validate(&self) -> Result<(), MetricsError> {
        let underscore_fields: [(&'static str, &str); 10] = [
            ("vendor", &self.vendor),
            ("partner", &self.partner),
            ("device", &self.device),
            ("software", &self.software),
            ("gpu", &self.gpu),
            ("cpu", &self.cpu),
            ("device_id", &self.device_id),
            ("device_region", &self.device_region),
            ("tenancy", &self.tenancy),
            ("advertising_id", &self.advertising_id),
        ];
        for (field, value) in underscore_fields {
            if !is_alnum_underscore(value) {
                return Err(MetricsError::InvalidField {
                    field,
                    value: value.to_owned(),
                });
            }
        }

        if !is_alnum_dash(&self.partner_guid) {
            return Err(MetricsError::InvalidField {
                field: "partner_guid",
                value: self.partner_guid.clone(),
            });
        }

        if self.tenancy != "prod" && self.tenancy != "dev" {
            return Err(MetricsError::InvalidTenancy(self.tenancy.clone()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_metrics() -> SystemMetrics {
        SystemMetrics {
            core_version: "1.2.3".into(),
            vendor: "acme".into(),
            partner: "acme_tv".into(),
            device: "settop_9000".into(),
            software: "linux".into(),
            revision: "4.9".into(),
            gpu: "vc4".into(),
            cpu: "cortex_a53".into(),
            device_id: "ab12cd34".into(),
            device_region: "us_east".into(),
            tenancy: "dev".into(),
            partner_guid: "1ab2-3cd4-5ef6".into(),
            advertising_id: "00000000000000000000000000000000".into(),
            device_class: DeviceClass::Stb,
            ..Default::default()
        }
    }

    #[test]
    fn valid_metrics_pass() {
        assert_eq!(valid_metrics().validate(), Ok(()));
    }

    #[test]
    fn spaces_and_punctuation_are_rejected() {
        let mut metrics = valid_metrics();
        metrics.device = "settop 9000".into();
        assert!(matches!(
            metrics.validate(),
            Err(MetricsError::InvalidField { field: "device", .. })
        ));

        let mut metrics = valid_metrics();
        metrics.gpu = "vc4;drop".into();
        assert!(matches!(
            metrics.validate(),
            Err(MetricsError::InvalidField { field: "gpu", .. })
        ));
    }

    #[test]
    fn partner_guid_allows_dashes_only() {
        let mut metrics = valid_metrics();
        metrics.partner_guid = "1ab2_3cd4".into();
        assert!(matches!(
            metrics.validate(),
            Err(MetricsError::InvalidField { field: "partner_guid", .. })
        ));
    }

    #[test]
    fn tenancy_is_prod_or_dev() {
        let mut metrics = valid_metrics();
        metrics.tenancy = "prod".into();
        assert_eq!(metrics.validate(), Ok(()));

        metrics.tenancy = "staging".into();
        assert_eq!(
            metrics.validate(),
            Err(MetricsError::InvalidTenancy("staging".into()))
        );
    }

    #[test]
    fn device_class_labels() {
        assert_eq!(DeviceClass::Stb.label(), "STB");
        assert_eq!(DeviceClass::Tv.label(), "TV");
        assert_eq!(DeviceClass::Dvr.label(), "Unknown");
    }
}

//! Device allow-list
//!
//! The single policy point deciding which `(device, parameter)` pairs reach
//! the state store. Built once from configuration and never mutated, so it
//! can be shared across request handlers without locking.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// Allowed devices and, optionally, allowed parameters
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FilterConfig {
    /// Device (or channel) addresses whose values are persisted
    pub devices: HashSet<String>,
    /// Parameter names to persist; empty means every parameter
    #[serde(default)]
    pub parameters: HashSet<String>,
}

impl FilterConfig {
    pub fn new<D, P>(devices: D, parameters: P) -> Self
    where
        D: IntoIterator,
        D::Item: Into<String>,
        P: IntoIterator,
        P::Item: Into<String>,
    {
        Self {
            devices: devices.into_iter().map(Into::into).collect(),
            parameters: parameters.into_iter().map(Into::into).collect(),
        }
    }

    /// Build from comma separated lists such as `HM_DEVICES`
    pub fn from_lists(devices: &str, parameters: &str) -> Self {
        Self::new(split_list(devices), split_list(parameters))
    }
}

fn split_list(list: &str) -> impl Iterator<Item = String> + '_ {
    list.split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(str::to_string)
}

/// Pure accept/reject decision over a [`FilterConfig`]
#[derive(Debug, Clone)]
pub struct DeviceFilter {
    config: FilterConfig,
}

impl DeviceFilter {
    pub fn new(config: FilterConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &FilterConfig {
        &self.config
    }

    /// Whether a value for `device_id`/`parameter` should be persisted.
    ///
    /// Channel addresses (`ADDRESS:CHANNEL`) also match when only their base
    /// address is allowed.
    pub fn accept(&self, device_id: &str, parameter: &str) -> bool {
        self.device_allowed(device_id) && self.parameter_allowed(parameter)
    }

    fn device_allowed(&self, device_id: &str) -> bool {
        if self.config.devices.contains(device_id) {
            return true;
        }
        match device_id.split_once(':') {
            Some((base, _channel)) => self.config.devices.contains(base),
            None => false,
        }
    }

    fn parameter_allowed(&self, parameter: &str) -> bool {
        self.config.parameters.is_empty() || self.config.parameters.contains(parameter)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn filter(devices: &[&str], parameters: &[&str]) -> DeviceFilter {
        DeviceFilter::new(FilterConfig::new(
            devices.iter().copied(),
            parameters.iter().copied(),
        ))
    }

    #[rstest]
    #[case("HM1", "STATE", true)]
    #[case("HM1", "LEVEL", true)]
    #[case("HM2", "STATE", false)]
    #[case("", "STATE", false)]
    fn test_empty_parameter_list_allows_everything(
        #[case] device: &str,
        #[case] parameter: &str,
        #[case] expected: bool,
    ) {
        assert_eq!(filter(&["HM1"], &[]).accept(device, parameter), expected);
    }

    #[rstest]
    #[case("HM1", "STATE", true)]
    #[case("HM1", "LEVEL", false)]
    #[case("HM2", "STATE", false)]
    #[case("HM2", "LEVEL", false)]
    fn test_parameter_list_restricts(
        #[case] device: &str,
        #[case] parameter: &str,
        #[case] expected: bool,
    ) {
        assert_eq!(filter(&["HM1"], &["STATE"]).accept(device, parameter), expected);
    }

    #[test]
    fn test_accept_matches_definition_exhaustively() {
        let devices = ["A", "B"];
        let parameters = ["P", "Q"];
        let f = filter(&devices[..1], &parameters[..1]);
        let unrestricted = filter(&devices[..1], &[]);

        for device in devices {
            for parameter in parameters {
                let expected_restricted = device == "A" && parameter == "P";
                assert_eq!(f.accept(device, parameter), expected_restricted);
                assert_eq!(unrestricted.accept(device, parameter), device == "A");
            }
        }
    }

    #[test]
    fn test_channel_address_matches_base_device() {
        let f = filter(&["000A1BE9A7F2C4"], &[]);
        assert!(f.accept("000A1BE9A7F2C4:1", "ACTUAL_TEMPERATURE"));
        assert!(f.accept("000A1BE9A7F2C4", "UNREACH"));
        assert!(!f.accept("000A1BE9A7F2C5:1", "ACTUAL_TEMPERATURE"));
    }

    #[test]
    fn test_single_channel_allow_list() {
        let f = filter(&["ABC:2"], &[]);
        assert!(f.accept("ABC:2", "STATE"));
        assert!(!f.accept("ABC:1", "STATE"));
        assert!(!f.accept("ABC", "STATE"));
    }

    #[test]
    fn test_from_lists_trims_and_skips_blanks() {
        let config = FilterConfig::from_lists(" HM1, HM2 ,,", "");
        assert_eq!(config.devices.len(), 2);
        assert!(config.devices.contains("HM2"));
        assert!(config.parameters.is_empty());
    }
}

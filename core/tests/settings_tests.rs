// tests/settings_tests.rs

mod common;

use common::*;
use portage::EndpointSettings;
use serial_test::serial;
use std::env;
use std::time::Duration;

const VARS: [&str; 5] = [
  "PORTAGE_ENDPOINT_NAME",
  "PORTAGE_INSTANCE_DISCRIMINATOR",
  "PORTAGE_CONCURRENCY",
  "PORTAGE_IMMEDIATE_RETRIES",
  "PORTAGE_DELAYED_RETRY_INCREMENT_SECS",
];

fn clear_env() {
  for var in VARS {
    env::remove_var(var);
  }
}

#[test]
#[serial]
fn test_from_env_reads_overrides_and_defaults() {
  setup_tracing();
  clear_env();
  env::set_var("PORTAGE_ENDPOINT_NAME", "orders");
  env::set_var("PORTAGE_INSTANCE_DISCRIMINATOR", "blue");
  env::set_var("PORTAGE_CONCURRENCY", "3");
  env::set_var("PORTAGE_DELAYED_RETRY_INCREMENT_SECS", "2");

  let settings = EndpointSettings::from_env().unwrap();
  clear_env();

  assert_eq!(settings.endpoint_name, "orders");
  assert_eq!(settings.instance_address().as_deref(), Some("orders-blue"));
  assert_eq!(settings.concurrency, 3);
  assert_eq!(settings.delayed_retry_increment, Duration::from_secs(2));
  assert_eq!(settings.immediate_retries, EndpointSettings::default().immediate_retries);
  assert_eq!(settings.error_queue, "error");
}

#[test]
#[serial]
fn test_from_env_requires_endpoint_name() {
  setup_tracing();
  clear_env();
  let err = EndpointSettings::from_env().unwrap_err();
  assert!(err.is_configuration());
  assert!(err.to_string().contains("PORTAGE_ENDPOINT_NAME"));
}

#[test]
#[serial]
fn test_from_env_rejects_unparseable_numbers() {
  setup_tracing();
  clear_env();
  env::set_var("PORTAGE_ENDPOINT_NAME", "orders");
  env::set_var("PORTAGE_IMMEDIATE_RETRIES", "many");
  let err = EndpointSettings::from_env().unwrap_err();
  clear_env();
  assert!(err.to_string().contains("PORTAGE_IMMEDIATE_RETRIES"));
}

#[test]
#[serial]
fn test_validate_rejects_bad_values() {
  setup_tracing();
  let valid = EndpointSettings::new("orders");
  valid.validate().unwrap();

  let mut zero_concurrency = valid.clone();
  zero_concurrency.concurrency = 0;
  assert!(zero_concurrency.validate().is_err());

  let mut same_queue = valid.clone();
  same_queue.error_queue = "orders".to_string();
  assert!(same_queue.validate().is_err());

  let mut blank_instance = valid;
  blank_instance.instance_discriminator = Some("  ".to_string());
  assert!(blank_instance.validate().is_err());
}

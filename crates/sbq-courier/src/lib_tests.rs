//! Tests for the sbq-courier library module.

use super::*;
use serial_test::serial;
use std::io::Write as _;

const COURIER_ENV_VARS: &[&str] = &[
    "ENV",
    "SBQ_MODE",
    "SBQ_MESSAGE",
    "SBQ_CONFIG",
    "SBQ__ENVIRONMENT",
    "SBQ__MAX_MESSAGES",
    "SBQ__PROVIDER",
    "SBQ__MESSAGE",
];

fn clear_courier_env() {
    for name in COURIER_ENV_VARS {
        std::env::remove_var(name);
    }
}

fn in_memory_config() -> CourierConfig {
    CourierConfig {
        environment: "dev".to_string(),
        provider: ProviderKind::InMemory,
        receive_timeout_seconds: 1,
        ..Default::default()
    }
}

mod cli_parsing_tests {
    use super::*;

    #[test]
    #[serial]
    fn test_defaults_leave_settings_unset() {
        clear_courier_env();

        let cli = Cli::try_parse_from(["sbq-courier"]).unwrap();

        assert!(cli.environment.is_none());
        assert!(cli.mode.is_none());
        assert!(cli.message.is_none());
        assert!(cli.provider.is_none());
        assert_eq!(cli.log_level, "info");
        assert!(!cli.json_logs);
    }

    #[test]
    #[serial]
    fn test_all_flags_parse() {
        clear_courier_env();

        let cli = Cli::try_parse_from([
            "sbq-courier",
            "--environment",
            "dev",
            "--mode",
            "send",
            "--message",
            "hello",
            "--max-messages",
            "10",
            "--receive-timeout-seconds",
            "5",
            "--timeout-seconds",
            "30",
            "--ack-policy",
            "best-effort",
            "--provider",
            "in-memory",
            "--json-logs",
        ])
        .unwrap();

        assert_eq!(cli.environment.as_deref(), Some("dev"));
        assert_eq!(cli.mode, Some(Mode::Send));
        assert_eq!(cli.message.as_deref(), Some("hello"));
        assert_eq!(cli.max_messages, Some(10));
        assert_eq!(cli.receive_timeout_seconds, Some(5));
        assert_eq!(cli.timeout_seconds, Some(30));
        assert_eq!(cli.ack_policy, Some(AckPolicyArg::BestEffort));
        assert_eq!(cli.provider, Some(ProviderKind::InMemory));
        assert!(cli.json_logs);
    }

    #[test]
    #[serial]
    fn test_environment_read_from_env_variable() {
        clear_courier_env();
        std::env::set_var("ENV", "prod");

        let cli = Cli::try_parse_from(["sbq-courier"]).unwrap();

        assert_eq!(cli.environment.as_deref(), Some("prod"));
        clear_courier_env();
    }

    #[test]
    #[serial]
    fn test_unknown_mode_is_rejected() {
        clear_courier_env();

        let result = Cli::try_parse_from(["sbq-courier", "--mode", "receive-only"]);

        assert!(result.is_err());
    }
}

mod configuration_tests {
    use super::*;

    #[test]
    fn test_config_defaults() {
        let config = CourierConfig::default();

        assert_eq!(config.environment, "");
        assert_eq!(config.mode, Mode::SendReceive);
        assert_eq!(config.message, "super cool message");
        assert_eq!(config.max_messages, 99);
        assert_eq!(config.receive_timeout_seconds, 60);
        assert!(config.timeout_seconds.is_none());
        assert_eq!(config.ack_policy, AckPolicyArg::StopOnFirstFailure);
        assert_eq!(config.provider, ProviderKind::AzureServiceBus);
    }

    #[test]
    #[serial]
    fn test_cli_overrides_layered_values() {
        clear_courier_env();
        let layered = CourierConfig {
            environment: "from-file".to_string(),
            max_messages: 5,
            ..Default::default()
        };
        let cli = Cli::try_parse_from(["sbq-courier", "--environment", "dev", "--mode", "send"])
            .unwrap();

        let config = layered.with_cli_overrides(&cli);

        assert_eq!(config.environment, "dev");
        assert_eq!(config.mode, Mode::Send);
        assert_eq!(config.max_messages, 5);
    }

    #[test]
    fn test_receive_options_clamp_batch_size() {
        let zero = CourierConfig {
            max_messages: 0,
            ..Default::default()
        };
        let huge = CourierConfig {
            max_messages: 500,
            ..Default::default()
        };

        assert_eq!(zero.receive_options().max_messages, 1);
        assert_eq!(huge.receive_options().max_messages, 99);
    }

    #[test]
    fn test_receive_options_carry_policy_and_timeout() {
        let config = CourierConfig {
            receive_timeout_seconds: 7,
            ack_policy: AckPolicyArg::BestEffort,
            ..Default::default()
        };

        let options = config.receive_options();

        assert_eq!(options.timeout, chrono::Duration::seconds(7));
        assert_eq!(options.ack_policy, AckPolicy::BestEffort);
    }

    #[test]
    fn test_operation_context_deadline() {
        let unbounded = CourierConfig::default().operation_context(CancellationToken::new());
        assert!(unbounded.deadline().is_none());

        let bounded = CourierConfig {
            timeout_seconds: Some(120),
            ..Default::default()
        }
        .operation_context(CancellationToken::new());
        assert_eq!(bounded.deadline(), Some(chrono::Duration::seconds(120)));
    }

    #[test]
    fn test_queue_config_for_azure_uses_namespace_and_endpoint() {
        let names = ResourceNames::for_environment("dev").unwrap();
        let config = CourierConfig {
            endpoint: Some("http://localhost:8080/".to_string()),
            ..Default::default()
        };

        match config.queue_config(&names).provider {
            ProviderConfig::AzureServiceBus(azure) => {
                assert_eq!(
                    azure.namespace_host,
                    "sbns-yym-dev-usce.servicebus.windows.net"
                );
                assert_eq!(azure.endpoint.as_deref(), Some("http://localhost:8080/"));
            }
            other => panic!("Expected Azure configuration, got {:?}", other),
        }
    }

    #[test]
    #[serial]
    fn test_load_configuration_from_toml_file() {
        clear_courier_env();
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            "environment = \"staging\"\nmode = \"send\"\nmax_messages = 12\nack_policy = \"best-effort\""
        )
        .unwrap();

        let config = load_configuration(Some(file.path())).unwrap();

        assert_eq!(config.environment, "staging");
        assert_eq!(config.mode, Mode::Send);
        assert_eq!(config.max_messages, 12);
        assert_eq!(config.ack_policy, AckPolicyArg::BestEffort);
        assert_eq!(config.message, DEFAULT_MESSAGE);
    }

    #[test]
    #[serial]
    fn test_environment_variables_override_file() {
        clear_courier_env();
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(file, "environment = \"staging\"\nmax_messages = 12").unwrap();
        std::env::set_var("SBQ__MAX_MESSAGES", "3");

        let config = load_configuration(Some(file.path()));
        clear_courier_env();

        let config = config.unwrap();
        assert_eq!(config.environment, "staging");
        assert_eq!(config.max_messages, 3);
    }

    #[test]
    #[serial]
    fn test_environment_variables_keep_numeric_looking_strings() {
        clear_courier_env();
        std::env::set_var("SBQ__ENVIRONMENT", "007");
        std::env::set_var("SBQ__MESSAGE", "1e3");
        std::env::set_var("SBQ__MAX_MESSAGES", "4");

        let config = load_configuration(None);
        clear_courier_env();

        let config = config.unwrap();
        assert_eq!(config.environment, "007");
        assert_eq!(config.message, "1e3");
        assert_eq!(config.max_messages, 4);
        assert_eq!(
            ResourceNames::for_environment(&config.environment)
                .unwrap()
                .queue_name
                .as_str(),
            "sbq-yym-007-usce"
        );
    }

    #[test]
    #[serial]
    fn test_load_configuration_without_sources_uses_defaults() {
        clear_courier_env();

        let config = load_configuration(None).unwrap();

        assert_eq!(config, CourierConfig::default());
    }

    #[test]
    #[serial]
    fn test_missing_config_file_is_reported() {
        clear_courier_env();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("absent.toml");

        let result = load_configuration(Some(&path));

        assert!(matches!(result, Err(ConfigError::FileNotFound { .. })));
    }

    #[test]
    #[serial]
    fn test_malformed_config_file_is_reported() {
        clear_courier_env();
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(file, "mode = \"sideways\"").unwrap();

        let result = load_configuration(Some(file.path()));

        assert!(matches!(result, Err(ConfigError::Load(_))));
    }
}

mod run_tests {
    use super::*;

    #[tokio::test]
    async fn test_send_receive_prints_sent_body() {
        let mut out = Vec::new();

        let summary = run(&in_memory_config(), &mut out, CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(String::from_utf8(out).unwrap(), "super cool message\n");
        assert_eq!(summary.queue.as_str(), "sbq-yym-dev-usce");
        let report = summary.received.unwrap();
        assert_eq!(report.received, 1);
        assert_eq!(report.completed, vec![summary.sent]);
        assert!(report.is_clean());
    }

    #[tokio::test]
    async fn test_send_mode_prints_nothing() {
        let config = CourierConfig {
            mode: Mode::Send,
            message: "only sent".to_string(),
            ..in_memory_config()
        };
        let mut out = Vec::new();

        let summary = run(&config, &mut out, CancellationToken::new())
            .await
            .unwrap();

        assert!(out.is_empty());
        assert!(summary.received.is_none());
    }

    #[tokio::test]
    async fn test_empty_environment_is_not_a_panic() {
        let config = CourierConfig {
            environment: String::new(),
            ..in_memory_config()
        };
        let mut out = Vec::new();

        let summary = run(&config, &mut out, CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(summary.queue.as_str(), "sbq-yym--usce");
    }

    #[tokio::test]
    async fn test_invalid_environment_is_configuration_error() {
        let config = CourierConfig {
            environment: "dev env".to_string(),
            ..in_memory_config()
        };
        let mut out = Vec::new();

        let result = run(&config, &mut out, CancellationToken::new()).await;

        assert!(matches!(
            result,
            Err(CliError::Configuration(ConfigError::Validation(_)))
        ));
    }

    #[tokio::test]
    async fn test_cancelled_run_reports_send_failure() {
        let token = CancellationToken::new();
        token.cancel();
        let mut out = Vec::new();

        let result = run(&in_memory_config(), &mut out, token).await;

        match result {
            Err(CliError::Operation(OperationError::Send { source, .. })) => {
                assert!(matches!(source, sbq_runtime::QueueError::Cancelled { .. }))
            }
            other => panic!("Expected cancelled send, got {:?}", other),
        }
        assert!(out.is_empty());
    }

    #[test]
    fn test_operation_error_display_names_failed_step() {
        let error = CliError::from(OperationError::Send {
            operation: "sender.send_message",
            source: sbq_runtime::QueueError::ClientClosed,
        });

        assert_eq!(
            error.to_string(),
            "Failed to build sender.send_message due to error: Queue client is already closed"
        );
    }
}

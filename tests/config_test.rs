use std::io::Write;

use stonenet::{Framing, HeaderWidth, ServerConfig};
use tempfile::Builder;

fn write_config(content: &str) -> tempfile::NamedTempFile {
    let mut file = Builder::new().suffix(".toml").tempfile().unwrap();
    file.write_all(content.as_bytes()).unwrap();
    file.flush().unwrap();
    file
}

#[test]
fn test_load_config_file() {
    let file = write_config(
        r#"
[network]
ip = "127.0.0.1"
port = 7000

[connection]
max_msg_num = 16
graceful_shutdown_timeout_ms = 300

[connection.framing]
protocol = "prefix_suffix"
prefix = "<"
suffix = ">"
"#,
    );

    let config = ServerConfig::set_up_config(file.path()).unwrap();
    assert_eq!(config.network.ip, "127.0.0.1");
    assert_eq!(config.network.port, 7000);
    // unspecified keys keep their defaults
    assert_eq!(config.network.max_connection, 4096);
    assert_eq!(config.connection.max_msg_num, 16);
    assert_eq!(config.connection.graceful_shutdown_timeout_ms, 300);
    assert_eq!(config.connection.msg_buffer_size, 4000);
    assert_eq!(
        config.connection.framing,
        Framing::PrefixSuffix {
            prefix: "<".into(),
            suffix: ">".into()
        }
    );
}

#[test]
fn test_load_length_prefixed_header() {
    let file = write_config(
        r#"
[connection.framing]
protocol = "length_prefixed"
header = 4
"#,
    );

    let config = ServerConfig::set_up_config(file.path()).unwrap();
    assert_eq!(
        config.connection.framing,
        Framing::LengthPrefixed {
            header: HeaderWidth::Four
        }
    );
}

#[test]
fn test_invalid_config_is_rejected() {
    let file = write_config(
        r#"
[connection]
msg_buffer_size = 1
"#,
    );
    assert!(ServerConfig::set_up_config(file.path()).is_err());

    let file = write_config(
        r#"
[connection.framing]
protocol = "length_prefixed"
header = 3
"#,
    );
    assert!(ServerConfig::set_up_config(file.path()).is_err());

    assert!(ServerConfig::set_up_config("/nonexistent/stonenet.toml").is_err());
}

//! Mail server configuration, sourced from the environment.

fn env_str(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_owned())
}

fn env_bool(key: &str) -> bool {
    matches!(
        std::env::var(key).as_deref(),
        Ok("1") | Ok("true") | Ok("TRUE") | Ok("yes")
    )
}

#[derive(Clone, Debug)]
pub struct MailServerConfig {
    pub smtp_host: String,
    pub smtp_hosts: Vec<String>,
    pub tls_enabled: bool,
    pub tls_privkey: String,
    pub tls_pubkey: String,
    pub http_api: bool,
    pub logging: bool,
    pub mail_storage_dir: String,
    pub db_host: String,
    pub db_port: u16,
    pub db_user: String,
    pub db_password: String,
    pub db_name: String,
    pub user_salt: String,
    pub dkim_privkey: String,
    pub dkim_selector: String,
}

impl Default for MailServerConfig {
    fn default() -> MailServerConfig {
        MailServerConfig {
            smtp_host: "localhost".to_owned(),
            smtp_hosts: vec!["localhost".to_owned()],
            tls_enabled: false,
            tls_privkey: String::new(),
            tls_pubkey: String::new(),
            http_api: false,
            logging: false,
            mail_storage_dir: "/tmp/mails".to_owned(),
            db_host: "localhost".to_owned(),
            db_port: 3306,
            db_user: "mail".to_owned(),
            db_password: "password".to_owned(),
            db_name: "mails".to_owned(),
            user_salt: "123".to_owned(),
            dkim_privkey: String::new(),
            dkim_selector: "default".to_owned(),
        }
    }
}

impl MailServerConfig {
    pub fn from_env() -> MailServerConfig {
        let defaults = MailServerConfig::default();
        let smtp_host = env_str("SMTP_HOST", &defaults.smtp_host);
        let smtp_hosts = env_str("SMTP_HOSTS", &smtp_host)
            .split(',')
            .map(|host| host.trim().to_owned())
            .filter(|host| !host.is_empty())
            .collect();
        MailServerConfig {
            smtp_hosts,
            tls_enabled: env_bool("SV_TLS_ENABLED"),
            tls_privkey: env_str("SV_TLS_PRIVKEY", ""),
            tls_pubkey: env_str("SV_TLS_PUBKEY", ""),
            http_api: env_bool("SV_HTTP_API"),
            logging: env_bool("SV_LOGGING"),
            mail_storage_dir: env_str("SV_MAIL_STORAGE_DIR", &defaults.mail_storage_dir)
                .trim_end_matches('/')
                .to_owned(),
            db_host: env_str("DB_HOST", &defaults.db_host),
            db_port: env_str("DB_PORT", "3306").parse().unwrap_or(3306),
            db_user: env_str("DB_USER", &defaults.db_user),
            db_password: env_str("DB_PASSWORD", &defaults.db_password),
            db_name: env_str("DB_NAME", &defaults.db_name),
            user_salt: env_str("USER_SALT", &defaults.user_salt),
            dkim_privkey: env_str("DKIM_PRIVKEY", ""),
            dkim_selector: env_str("DKIM_SELECTOR", &defaults.dkim_selector),
            smtp_host,
        }
    }

    /// True when `host` is one of the domains this server receives for.
    pub fn is_local_host(&self, host: &str) -> bool {
        self.smtp_hosts.iter().any(|h| h == host)
    }
}

use std::time::{Duration, SystemTime};

use lettre::message::header::ContentType;
use lettre::message::Mailbox;
use lettre::transport::smtp::authentication::{Credentials, Mechanism};
use lettre::transport::smtp::client::{SmtpConnection, TlsParameters};
use lettre::transport::smtp::commands::{Data, Mail, Rcpt};
use lettre::transport::smtp::extension::ClientId;
use lettre::{Address, Message};
use tracing::{debug, warn};

use crate::address::EmailAddress;
use crate::mail::{MailError, MailTransport, OutgoingMail, TransportReport};

const DEFAULT_SMTP_PORT: u16 = 25;

#[derive(Debug, Clone)]
pub struct SmtpSettings {
    /// `host` or `host:port`; port 25 when omitted.
    pub address: String,
    pub user: String,
    pub password: String,
    pub helo: String,
    pub timeout: Duration,
}

impl SmtpSettings {
    pub fn is_configured(&self) -> bool {
        !self.address.trim().is_empty() && !self.user.trim().is_empty()
    }
}

/// Delivers mail over one SMTP session per message.
///
/// Tries implicit TLS first and falls back to a plain connection upgraded
/// with STARTTLS when the server offers it. Recipients the server refuses
/// are skipped; the message goes out to the rest.
pub struct SmtpRelay {
    settings: SmtpSettings,
    host: String,
    port: u16,
}

impl SmtpRelay {
    pub fn new(settings: SmtpSettings) -> Result<Self, MailError> {
        let (host, port) = split_host_port(&settings.address)?;
        Ok(Self {
            settings,
            host,
            port,
        })
    }

    fn connect(&self) -> Result<SmtpConnection, MailError> {
        let hello = ClientId::Domain(self.settings.helo.clone());
        let timeout = Some(self.settings.timeout);
        let tls = TlsParameters::new(self.host.clone())?;
        let server = (self.host.as_str(), self.port);

        match SmtpConnection::connect(server, timeout, &hello, Some(&tls), None) {
            Ok(conn) => Ok(conn),
            Err(err) => {
                debug!(
                    "implicit tls to {}:{} failed, retrying plain: {}",
                    self.host, self.port, err
                );
                let mut conn = SmtpConnection::connect(server, timeout, &hello, None, None)?;
                if conn.can_starttls() {
                    conn.starttls(&tls, &hello)?;
                }
                Ok(conn)
            }
        }
    }

    fn authenticate(&self, conn: &mut SmtpConnection) -> Result<(), MailError> {
        let mechanisms: Vec<Mechanism> = [Mechanism::Plain, Mechanism::Login]
            .into_iter()
            .filter(|mechanism| conn.server_info().supports_auth_mechanism(*mechanism))
            .collect();
        if mechanisms.is_empty() {
            return Ok(());
        }
        let credentials =
            Credentials::new(self.settings.user.clone(), self.settings.password.clone());
        conn.auth(&mechanisms, &credentials)?;
        Ok(())
    }

    fn session(&self, mail: &OutgoingMail) -> Result<TransportReport, MailError> {
        let mut conn = self.connect()?;
        self.authenticate(&mut conn)?;

        let sender: Address = mail.sender.address.parse()?;
        conn.command(Mail::new(Some(sender), vec![]))?;

        let mut report = TransportReport::default();
        for recipient in &mail.recipients {
            let address: Address = match recipient.address.parse() {
                Ok(address) => address,
                Err(err) => {
                    warn!("{} is not a valid recipient, ignored: {}", recipient, err);
                    report.rejected.push(recipient.clone());
                    continue;
                }
            };
            match conn.command(Rcpt::new(address, vec![])) {
                Ok(_) => report.accepted.push(recipient.clone()),
                Err(err) => {
                    warn!("{} rcpt refused, ignored: {}", recipient, err);
                    report.rejected.push(recipient.clone());
                }
            }
        }
        if report.accepted.is_empty() {
            let _ = conn.quit();
            return Err(MailError::NoValidRecipient);
        }

        let formatted = build_message(mail, &report.accepted)?.formatted();
        conn.command(Data)?;
        conn.message(&formatted)?;
        if let Err(err) = conn.quit() {
            debug!("smtp quit failed: {}", err);
        }
        Ok(report)
    }
}

impl MailTransport for SmtpRelay {
    fn deliver(&self, mail: &OutgoingMail) -> Result<TransportReport, MailError> {
        self.session(mail)
    }
}

fn mailbox(address: &EmailAddress) -> Result<Mailbox, MailError> {
    let parsed: Address = address.address.parse()?;
    let name = Some(address.name.trim())
        .filter(|name| !name.is_empty())
        .map(str::to_string);
    Ok(Mailbox::new(name, parsed))
}

fn build_message(mail: &OutgoingMail, accepted: &[EmailAddress]) -> Result<Message, MailError> {
    let mut builder = Message::builder()
        .from(mailbox(&mail.from)?)
        .reply_to(mailbox(&mail.reply_to)?)
        .subject(mail.subject.clone())
        .date(SystemTime::from(mail.date))
        .header(ContentType::TEXT_PLAIN);
    for recipient in accepted {
        builder = builder.to(mailbox(recipient)?);
    }
    if let Some(message_id) = mail.in_reply_to.as_deref().filter(|id| !id.is_empty()) {
        builder = builder
            .in_reply_to(message_id.to_string())
            .references(message_id.to_string());
    }
    Ok(builder.body(mail.body.clone())?)
}

/// Splits `host[:port]`, defaulting the port to 25.
pub fn split_host_port(address: &str) -> Result<(String, u16), MailError> {
    let address = address.trim();
    if address.is_empty() {
        return Err(MailError::NotConfigured);
    }
    if let Some(rest) = address.strip_prefix('[') {
        let (host, tail) = rest
            .split_once(']')
            .ok_or_else(|| MailError::ServerAddress(address.to_string()))?;
        let port = match tail.strip_prefix(':') {
            Some(port) => parse_port(address, port)?,
            None if tail.is_empty() => DEFAULT_SMTP_PORT,
            None => return Err(MailError::ServerAddress(address.to_string())),
        };
        return Ok((host.to_string(), port));
    }
    match address.rsplit_once(':') {
        Some((host, _)) if host.contains(':') => {
            Err(MailError::ServerAddress(address.to_string()))
        }
        Some((host, port)) => Ok((host.to_string(), parse_port(address, port)?)),
        None => Ok((address.to_string(), DEFAULT_SMTP_PORT)),
    }
}

fn parse_port(address: &str, port: &str) -> Result<u16, MailError> {
    port.parse()
        .map_err(|_| MailError::ServerAddress(address.to_string()))
}

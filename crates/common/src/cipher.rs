//! Field cipher: optional envelope encryption for selected notification columns.
//!
//! Envelope layout: `enc:v1:` + base64url(nonce[12] ‖ tag[16] ‖ ciphertext),
//! AES-256-GCM with empty associated data. When no key is configured values
//! pass through unchanged.

use aes_gcm::aead::generic_array::GenericArray;
use aes_gcm::aead::{AeadInPlace, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use base64::Engine;
use base64::engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD};
use rand::RngCore;
use rand::rngs::OsRng;

use crate::config::{EncryptedFields, EncryptionConfig};
use crate::error::AppError;
use crate::types::Notification;

pub const ENVELOPE_PREFIX: &str = "enc:v1:";
const NONCE_LEN: usize = 12;
const TAG_LEN: usize = 16;
const KEY_LEN: usize = 32;

/// A column the cipher may be toggled on for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncryptedField {
    ToName,
    Subject,
    BodyHtml,
    BodyText,
}

impl EncryptedField {
    pub fn column(self) -> &'static str {
        match self {
            EncryptedField::ToName => "to_name",
            EncryptedField::Subject => "subject",
            EncryptedField::BodyHtml => "body_html",
            EncryptedField::BodyText => "body_text",
        }
    }
}

/// True when `value` would be taken for an envelope on read.
pub fn looks_sealed(value: &str) -> bool {
    value.starts_with(ENVELOPE_PREFIX)
}

#[derive(Clone)]
pub struct FieldCipher {
    cipher: Option<Aes256Gcm>,
    fields: EncryptedFields,
}

impl std::fmt::Debug for FieldCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FieldCipher")
            .field("enabled", &self.is_enabled())
            .field("fields", &self.fields)
            .finish()
    }
}

impl Default for FieldCipher {
    fn default() -> Self {
        Self::disabled()
    }
}

impl FieldCipher {
    /// A cipher that never encrypts.
    pub fn disabled() -> Self {
        Self {
            cipher: None,
            fields: EncryptedFields::default(),
        }
    }

    pub fn new(key: &[u8], fields: EncryptedFields) -> Result<Self, AppError> {
        if key.len() != KEY_LEN {
            return Err(AppError::Config(format!(
                "encryption key must be {} bytes, got {}",
                KEY_LEN,
                key.len()
            )));
        }
        let cipher = Aes256Gcm::new_from_slice(key)
            .map_err(|_| AppError::Config("invalid encryption key".to_string()))?;
        Ok(Self {
            cipher: Some(cipher),
            fields,
        })
    }

    pub fn from_config(config: &EncryptionConfig) -> Result<Self, AppError> {
        if !config.enabled {
            return Ok(Self::disabled());
        }
        let encoded = config.key.as_deref().ok_or_else(|| {
            AppError::Config("encryption enabled but no key configured".to_string())
        })?;
        let key = STANDARD
            .decode(encoded.trim())
            .map_err(|e| AppError::Config(format!("encryption key is not valid base64: {}", e)))?;
        Self::new(&key, config.fields)
    }

    pub fn is_enabled(&self) -> bool {
        self.cipher.is_some()
    }

    pub fn applies_to(&self, field: EncryptedField) -> bool {
        self.is_enabled()
            && match field {
                EncryptedField::ToName => self.fields.to_name,
                EncryptedField::Subject => self.fields.subject,
                EncryptedField::BodyHtml => self.fields.body_html,
                EncryptedField::BodyText => self.fields.body_text,
            }
    }

    /// Encrypt a value. Input that already looks like an envelope is sealed
    /// again like any other text.
    pub fn seal(&self, plaintext: &str) -> Result<String, AppError> {
        let Some(cipher) = &self.cipher else {
            return Ok(plaintext.to_string());
        };

        let mut nonce_bytes = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce_bytes);

        let mut buffer = plaintext.as_bytes().to_vec();
        let tag = cipher
            .encrypt_in_place_detached(Nonce::from_slice(&nonce_bytes), b"", &mut buffer)
            .map_err(|_| AppError::Crypto("encryption failed".to_string()))?;

        let mut envelope = Vec::with_capacity(NONCE_LEN + TAG_LEN + buffer.len());
        envelope.extend_from_slice(&nonce_bytes);
        envelope.extend_from_slice(tag.as_slice());
        envelope.extend_from_slice(&buffer);

        Ok(format!("{}{}", ENVELOPE_PREFIX, URL_SAFE_NO_PAD.encode(envelope)))
    }

    /// Decrypt a value. Values without the envelope prefix pass through, so rows
    /// written before encryption was enabled stay readable.
    pub fn open(&self, value: &str) -> Result<String, AppError> {
        let Some(encoded) = value.strip_prefix(ENVELOPE_PREFIX) else {
            return Ok(value.to_string());
        };
        let Some(cipher) = &self.cipher else {
            return Err(AppError::Crypto(
                "encrypted value found but no key configured".to_string(),
            ));
        };

        let raw = URL_SAFE_NO_PAD
            .decode(encoded)
            .map_err(|_| AppError::Crypto("malformed envelope encoding".to_string()))?;
        if raw.len() < NONCE_LEN + TAG_LEN {
            return Err(AppError::Crypto("envelope too short".to_string()));
        }

        let (nonce, rest) = raw.split_at(NONCE_LEN);
        let (tag, ciphertext) = rest.split_at(TAG_LEN);
        let mut buffer = ciphertext.to_vec();
        cipher
            .decrypt_in_place_detached(
                Nonce::from_slice(nonce),
                b"",
                &mut buffer,
                GenericArray::from_slice(tag),
            )
            .map_err(|_| AppError::Crypto("authentication failed".to_string()))?;

        String::from_utf8(buffer)
            .map_err(|_| AppError::Crypto("decrypted value is not UTF-8".to_string()))
    }

    /// Seal an optional column if its toggle is on.
    ///
    /// A value kept in the clear must not start with the envelope prefix, or
    /// it would be read back as ciphertext.
    pub fn seal_field(
        &self,
        field: EncryptedField,
        value: Option<&str>,
    ) -> Result<Option<String>, AppError> {
        match value {
            Some(v) if self.applies_to(field) => self.seal(v).map(Some),
            Some(v) if looks_sealed(v) => Err(AppError::Validation(format!(
                "{} must not start with '{}'",
                field.column(),
                ENVELOPE_PREFIX
            ))),
            other => Ok(other.map(str::to_string)),
        }
    }

    fn open_field(&self, value: Option<String>) -> Result<Option<String>, AppError> {
        value.map(|v| self.open(&v)).transpose()
    }

    /// Encrypt the configured columns of a row before it is written.
    pub fn seal_notification(&self, notification: &mut Notification) -> Result<(), AppError> {
        notification.to_name =
            self.seal_field(EncryptedField::ToName, notification.to_name.as_deref())?;
        notification.subject =
            self.seal_field(EncryptedField::Subject, notification.subject.as_deref())?;
        notification.body_html =
            self.seal_field(EncryptedField::BodyHtml, notification.body_html.as_deref())?;
        notification.body_text =
            self.seal_field(EncryptedField::BodyText, notification.body_text.as_deref())?;
        Ok(())
    }

    /// Decrypt every sealed column of a row after it is read.
    ///
    /// Opens regardless of the current toggles so a field that was encrypted
    /// under an earlier configuration still reads back.
    pub fn open_notification(&self, notification: &mut Notification) -> Result<(), AppError> {
        notification.to_name = self.open_field(notification.to_name.take())?;
        notification.subject = self.open_field(notification.subject.take())?;
        notification.body_html = self.open_field(notification.body_html.take())?;
        notification.body_text = self.open_field(notification.body_text.take())?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_key() -> [u8; 32] {
        [7u8; 32]
    }

    fn enabled() -> FieldCipher {
        FieldCipher::new(&test_key(), EncryptedFields::default()).unwrap()
    }

    #[test]
    fn test_round_trip() {
        let cipher = enabled();
        let sealed = cipher.seal("Welcome aboard, Ada").unwrap();
        assert!(sealed.starts_with(ENVELOPE_PREFIX));
        assert_ne!(sealed, "Welcome aboard, Ada");
        assert_eq!(cipher.open(&sealed).unwrap(), "Welcome aboard, Ada");
    }

    #[test]
    fn test_envelope_layout() {
        let cipher = enabled();
        let plaintext = "hello";
        let sealed = cipher.seal(plaintext).unwrap();
        let raw = URL_SAFE_NO_PAD
            .decode(sealed.strip_prefix(ENVELOPE_PREFIX).unwrap())
            .unwrap();
        assert_eq!(raw.len(), NONCE_LEN + TAG_LEN + plaintext.len());
        assert!(!sealed.contains('='));
    }

    #[test]
    fn test_fresh_nonce_per_seal() {
        let cipher = enabled();
        assert_ne!(cipher.seal("same").unwrap(), cipher.seal("same").unwrap());
    }

    #[test]
    fn test_wrong_key_fails() {
        let sealed = enabled().seal("secret").unwrap();
        let other = FieldCipher::new(&[9u8; 32], EncryptedFields::default()).unwrap();
        assert!(matches!(other.open(&sealed), Err(AppError::Crypto(_))));
    }

    #[test]
    fn test_tampered_envelope_fails() {
        let cipher = enabled();
        let mut sealed = cipher.seal("secret").unwrap();
        let last = sealed.pop().unwrap();
        sealed.push(if last == 'A' { 'B' } else { 'A' });
        assert!(cipher.open(&sealed).is_err());
    }

    #[test]
    fn test_disabled_is_pass_through() {
        let cipher = FieldCipher::disabled();
        assert_eq!(cipher.seal("plain").unwrap(), "plain");
        assert_eq!(cipher.open("plain").unwrap(), "plain");
        assert!(!cipher.applies_to(EncryptedField::Subject));
    }

    #[test]
    fn test_plaintext_passes_through_open() {
        assert_eq!(enabled().open("legacy row").unwrap(), "legacy row");
    }

    #[test]
    fn test_field_toggles() {
        let cipher = FieldCipher::new(
            &test_key(),
            EncryptedFields {
                subject: false,
                ..EncryptedFields::default()
            },
        )
        .unwrap();
        assert_eq!(
            cipher
                .seal_field(EncryptedField::Subject, Some("Hi"))
                .unwrap()
                .as_deref(),
            Some("Hi")
        );
        let html = cipher
            .seal_field(EncryptedField::BodyHtml, Some("<p>Hi</p>"))
            .unwrap()
            .unwrap();
        assert!(html.starts_with(ENVELOPE_PREFIX));
        assert_eq!(cipher.seal_field(EncryptedField::ToName, None).unwrap(), None);
    }

    #[test]
    fn test_envelope_lookalike_is_sealed_again() {
        let cipher = enabled();
        let sealed = cipher.seal("enc:v1:Ada").unwrap();
        assert_ne!(sealed, "enc:v1:Ada");
        assert_eq!(cipher.open(&sealed).unwrap(), "enc:v1:Ada");
    }

    #[test]
    fn test_envelope_lookalike_rejected_in_clear() {
        let disabled = FieldCipher::disabled();
        assert!(matches!(
            disabled.seal_field(EncryptedField::ToName, Some("enc:v1:Ada")),
            Err(AppError::Validation(_))
        ));

        let no_subject = FieldCipher::new(
            &test_key(),
            EncryptedFields {
                subject: false,
                ..EncryptedFields::default()
            },
        )
        .unwrap();
        assert!(matches!(
            no_subject.seal_field(EncryptedField::Subject, Some("enc:v1:hello")),
            Err(AppError::Validation(_))
        ));
        let name = no_subject
            .seal_field(EncryptedField::ToName, Some("enc:v1:Ada"))
            .unwrap()
            .unwrap();
        assert_eq!(no_subject.open(&name).unwrap(), "enc:v1:Ada");
    }

    #[test]
    fn test_from_config() {
        let config = EncryptionConfig {
            enabled: true,
            key: Some(STANDARD.encode(test_key())),
            fields: EncryptedFields::default(),
        };
        assert!(FieldCipher::from_config(&config).unwrap().is_enabled());

        let short = EncryptionConfig {
            key: Some(STANDARD.encode([1u8; 16])),
            ..config.clone()
        };
        assert!(matches!(
            FieldCipher::from_config(&short),
            Err(AppError::Config(_))
        ));

        let disabled = EncryptionConfig {
            enabled: false,
            ..config
        };
        assert!(!FieldCipher::from_config(&disabled).unwrap().is_enabled());
    }
}

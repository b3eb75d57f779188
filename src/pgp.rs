//! OpenPGP encryption and signing for staged volumes.
//!
//! Recipients come from the public keyring (`--publicKeyRingPath` +
//! `--encryptTo`), the signer from the secret keyring
//! (`--secretKeyRingPath` + `--signFrom`). Both directions are streaming:
//! [`seal`] wraps the stage sink in sequoia's serializer stack, [`open`]
//! hands the stage a cleartext reader backed by the decryptor/verifier.

use anyhow::{Context, Result, anyhow, bail};
use sequoia_openpgp as openpgp;

use openpgp::{
    Cert, Fingerprint, KeyHandle,
    cert::CertParser,
    crypto::SessionKey,
    packet::{PKESK, SKESK},
    parse::{
        Parse,
        stream::{
            DecryptionHelper, DecryptorBuilder, MessageLayer, MessageStructure,
            VerificationHelper, VerifierBuilder,
        },
    },
    policy::{Policy, StandardPolicy},
    serialize::stream::{Encryptor2, LiteralWriter, Message, Signer},
    types::SymmetricAlgorithm,
};
use std::io::{Read, Write};
use std::path::Path;

/// Object-key extension contributed by encryption or signing.
pub const EXTENSION: &str = "pgp";

/// All certificates found in one keyring file.
pub struct Keyring {
    certs: Vec<Cert>,
}

impl Keyring {
    /// Read every certificate from an armored or binary keyring.
    ///
    /// # Errors
    /// Unreadable files or rings with no usable certificate.
    pub fn load(path: &Path) -> Result<Self> {
        let parser = CertParser::from_file(path)
            .with_context(|| format!("open keyring {}", path.display()))?;

        let mut certs = Vec::new();
        for cert in parser {
            certs.push(cert.with_context(|| format!("parse keyring {}", path.display()))?);
        }

        if certs.is_empty() {
            bail!("keyring {} contains no certificates", path.display());
        }

        Ok(Self { certs })
    }

    #[must_use]
    pub fn certs(&self) -> &[Cert] {
        &self.certs
    }

    /// Find the certificate for a user: user-id substring match
    /// (case-insensitive) or fingerprint prefix.
    ///
    /// # Errors
    /// No matching certificate in the ring.
    pub fn find(&self, user: &str) -> Result<&Cert> {
        let needle = user.to_lowercase();

        self.certs
            .iter()
            .find(|cert| {
                cert.userids().any(|ua| {
                    String::from_utf8_lossy(ua.userid().value())
                        .to_lowercase()
                        .contains(&needle)
                }) || cert
                    .fingerprint()
                    .to_hex()
                    .to_lowercase()
                    .starts_with(&needle)
            })
            .ok_or_else(|| anyhow!("no key for {user:?} in the keyring"))
    }
}

/// Wrap `sink` in encryption and/or signing layers and let `fill` write the
/// cleartext. At least one of `recipients`/`signer` must be present.
///
/// # Errors
/// Missing usable keys, or any I/O failure from `fill`.
pub fn seal<F>(
    recipients: &[Cert],
    signer: Option<&Cert>,
    sink: &mut (dyn Write + Send + Sync),
    fill: F,
) -> Result<()>
where
    F: FnOnce(&mut dyn Write) -> Result<()>,
{
    let policy = StandardPolicy::new();

    let message = Message::new(sink);

    let message = if recipients.is_empty() {
        message
    } else {
        let mut keys = Vec::new();
        for cert in recipients {
            for ka in cert
                .keys()
                .with_policy(&policy, None)
                .supported()
                .alive()
                .revoked(false)
                .for_transport_encryption()
                .for_storage_encryption()
            {
                keys.push(ka);
            }
        }

        if keys.is_empty() {
            bail!("none of the recipient certificates has a usable encryption key");
        }

        Encryptor2::for_recipients(message, keys)
            .build()
            .context("assemble encryptor")?
    };

    let message = match signer {
        Some(cert) => Signer::new(message, signing_keypair(&policy, cert)?)
            .build()
            .context("assemble signer")?,
        None => message,
    };

    let mut literal = LiteralWriter::new(message)
        .build()
        .context("assemble literal writer")?;

    fill(&mut literal)?;

    literal.finalize().context("finalize OpenPGP message")?;

    Ok(())
}

/// Open a sealed payload: decrypt with `secrets` when `encrypted`, verify
/// against `verifiers` when `require_signature`, and hand `drain` the
/// cleartext reader.
///
/// # Errors
/// Missing keys, failed decryption, or a missing/bad signature when one is
/// required.
pub fn open<R, F, T>(
    secrets: &[Cert],
    verifiers: &[Cert],
    encrypted: bool,
    require_signature: bool,
    source: R,
    drain: F,
) -> Result<T>
where
    R: Read + Send + Sync,
    F: FnOnce(&mut dyn Read) -> Result<T>,
{
    let policy = StandardPolicy::new();
    let helper = Helper {
        secrets,
        verifiers,
        policy: &policy,
        require_signature,
    };

    if encrypted {
        let mut decryptor = DecryptorBuilder::from_reader(source)
            .context("read OpenPGP message")?
            .with_policy(&policy, None, helper)
            .context("decrypt")?;
        drain(&mut decryptor)
    } else {
        let mut verifier = VerifierBuilder::from_reader(source)
            .context("read OpenPGP message")?
            .with_policy(&policy, None, helper)
            .context("verify")?;
        drain(&mut verifier)
    }
}

fn signing_keypair(
    policy: &dyn Policy,
    cert: &Cert,
) -> Result<openpgp::crypto::KeyPair> {
    let ka = cert
        .keys()
        .unencrypted_secret()
        .with_policy(policy, None)
        .supported()
        .alive()
        .revoked(false)
        .for_signing()
        .next()
        .ok_or_else(|| anyhow!("the signing certificate has no usable secret signing key"))?;

    ka.key().clone().into_keypair().context("signing keypair")
}

struct Helper<'a> {
    secrets: &'a [Cert],
    verifiers: &'a [Cert],
    policy: &'a dyn Policy,
    require_signature: bool,
}

impl VerificationHelper for Helper<'_> {
    fn get_certs(&mut self, _ids: &[KeyHandle]) -> openpgp::Result<Vec<Cert>> {
        // hand everything over; sequoia picks the issuer itself
        Ok(self
            .verifiers
            .iter()
            .chain(self.secrets.iter())
            .cloned()
            .collect())
    }

    fn check(&mut self, structure: MessageStructure) -> openpgp::Result<()> {
        if !self.require_signature {
            return Ok(());
        }

        for layer in structure {
            if let MessageLayer::SignatureGroup { results } = layer {
                if results.iter().any(Result::is_ok) {
                    return Ok(());
                }
                return Err(anyhow!("signature verification failed"));
            }
        }

        Err(anyhow!("required signature is missing"))
    }
}

impl DecryptionHelper for Helper<'_> {
    fn decrypt<D>(
        &mut self,
        pkesks: &[PKESK],
        _skesks: &[SKESK],
        sym_algo: Option<SymmetricAlgorithm>,
        mut decrypt: D,
    ) -> openpgp::Result<Option<Fingerprint>>
    where
        D: FnMut(SymmetricAlgorithm, &SessionKey) -> bool,
    {
        for pkesk in pkesks {
            for cert in self.secrets {
                for ka in cert
                    .keys()
                    .unencrypted_secret()
                    .with_policy(self.policy, None)
                    .supported()
                    .for_transport_encryption()
                    .for_storage_encryption()
                {
                    if pkesk.recipient() != &ka.key().keyid() {
                        continue;
                    }

                    let mut pair = ka.key().clone().into_keypair()?;
                    if pkesk
                        .decrypt(&mut pair, sym_algo)
                        .is_some_and(|(algo, session_key)| decrypt(algo, &session_key))
                    {
                        return Ok(Some(cert.fingerprint()));
                    }
                }
            }
        }

        Err(anyhow!("no usable decryption key for this payload"))
    }
}

//! Join handshake: announce an address, answering the server's challenge
//! with a signature when it asks for proof of identity.
//!
//! The first join carries the marshaled public key (or nothing for an
//! anonymous listener). A challenge is answered by signing it; the resulting
//! proof is cached so a rejoin after reconnect can present it directly.

use crate::channel::{Channel, ChannelError};
use crate::identity::IdentityKeys;
use crate::relay::protocol::{parse_ack, JoinCredential, JoinProof, Value, EVENT_JOIN};
use libp2p::Multiaddr;
use thiserror::Error;
use tracing::{debug, info};

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum HandshakeError {
    #[error("Cannot satisfy crypto challenge without an identity")]
    MissingIdentity,
    #[error("Server repeated challenge {0}")]
    RepeatedChallenge(String),
    #[error("Gave up after {0} challenge rounds")]
    TooManyChallenges(u32),
    #[error("Join rejected: {0}")]
    Rejected(String),
    #[error("Malformed join reply")]
    Malformed,
    #[error("Channel error: {0}")]
    Channel(#[from] ChannelError),
}

impl HandshakeError {
    /// Faults that no retry can fix; the listener must be torn down
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            HandshakeError::MissingIdentity
                | HandshakeError::RepeatedChallenge(_)
                | HandshakeError::TooManyChallenges(_)
                | HandshakeError::Malformed
        )
    }
}

/// Server's answer to one join request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JoinReply {
    Accepted,
    Challenge(String),
}

/// Interpret join acknowledgement arguments
pub fn parse_join_reply(args: Vec<Value>) -> Result<JoinReply, HandshakeError> {
    let payload = parse_ack(args)
        .map_err(|_| HandshakeError::Malformed)?
        .map_err(HandshakeError::Rejected)?;

    match payload.as_slice() {
        [] | [Value::Null] => Ok(JoinReply::Accepted),
        [Value::Str(challenge)] if !challenge.is_empty() => {
            Ok(JoinReply::Challenge(challenge.clone()))
        }
        _ => Err(HandshakeError::Malformed),
    }
}

/// Join state kept by one listener across reconnects
#[derive(Debug)]
pub struct JoinHandshake {
    identity: Option<IdentityKeys>,
    cached: Option<JoinProof>,
    max_rounds: u32,
}

impl JoinHandshake {
    pub fn new(identity: Option<IdentityKeys>, max_rounds: u32) -> Self {
        Self {
            identity,
            cached: None,
            max_rounds,
        }
    }

    pub fn cached_proof(&self) -> Option<&JoinProof> {
        self.cached.as_ref()
    }

    /// Credential for the first request of a join
    pub fn initial_credential(&self) -> JoinCredential {
        match (&self.cached, &self.identity) {
            (Some(proof), _) => JoinCredential::Proof(proof.clone()),
            (None, Some(identity)) => JoinCredential::PublicKey(identity.public_key_hex()),
            (None, None) => JoinCredential::None,
        }
    }

    /// Sign `challenge` and cache the resulting proof
    pub fn answer(&mut self, challenge: &str) -> Result<JoinCredential, HandshakeError> {
        let identity = self
            .identity
            .as_ref()
            .ok_or(HandshakeError::MissingIdentity)?;

        let proof = JoinProof {
            public_key: identity.public_key_hex(),
            challenge: challenge.to_string(),
            signature: hex::encode(identity.sign(challenge.as_bytes())),
        };
        self.cached = Some(proof.clone());
        Ok(JoinCredential::Proof(proof))
    }

    /// Run the join exchange for `addr` on `channel`
    pub async fn join(&mut self, channel: &Channel, addr: &Multiaddr) -> Result<(), HandshakeError> {
        let mut credential = self.initial_credential();
        let mut last_challenge: Option<String> = None;
        let mut rounds = 0u32;

        loop {
            debug!("Joining {} ({} credential)", addr, credential_kind(&credential));
            let args = vec![Value::from(addr.to_string()), Value::from(credential.to_wire())];
            let reply = channel.call(EVENT_JOIN, args).await?;

            match parse_join_reply(reply) {
                Ok(JoinReply::Accepted) => {
                    info!("Joined rendezvous as {}", addr);
                    return Ok(());
                }
                Ok(JoinReply::Challenge(challenge)) => {
                    if last_challenge.as_deref() == Some(challenge.as_str()) {
                        return Err(HandshakeError::RepeatedChallenge(challenge));
                    }
                    rounds += 1;
                    if rounds > self.max_rounds {
                        return Err(HandshakeError::TooManyChallenges(rounds));
                    }
                    credential = self.answer(&challenge)?;
                    last_challenge = Some(challenge);
                }
                Err(e) => {
                    if matches!(e, HandshakeError::Rejected(_)) {
                        self.cached = None;
                    }
                    return Err(e);
                }
            }
        }
    }
}

fn credential_kind(credential: &JoinCredential) -> &'static str {
    match credential {
        JoinCredential::None => "no",
        JoinCredential::PublicKey(_) => "public key",
        JoinCredential::Proof(_) => "signed",
    }
}

// ============================================================================
// TESTS
// ============================================================================

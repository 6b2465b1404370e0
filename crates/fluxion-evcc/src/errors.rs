// Copyright (c) 2025 SOLARE S.R.O.
//
// This file is part of FluxION.
//
// Licensed under the Creative Commons Attribution-NonCommercial-NoDerivatives 4.0 International
// (CC BY-NC-ND 4.0). You may use and share this file for non-commercial purposes only and you may not
// create derivatives. See <https://creativecommons.org/licenses/by-nc-nd/4.0/>.
//
// This software is provided "AS IS", without warranty of any kind.
//
// For commercial licensing, please contact: info@solare.cz

use thiserror::Error;

/// EVCC bridge error types
#[derive(Error, Debug)]
pub enum EvccError {
    #[error("HTTP request failed: {0}")]
    HttpError(#[from] reqwest::Error),

    #[error("EVCC API returned error status {status}: {message}")]
    ApiError { status: u16, message: String },

    #[error("Connection timeout")]
    Timeout,

    #[error("WebSocket error: {0}")]
    WebSocket(String),

    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    #[error("Invalid payload: {0}")]
    InvalidPayload(String),

    #[error("Command rejected: {command} - {reason}")]
    CommandFailed { command: String, reason: String },

    #[error("Configuration error: {0}")]
    ConfigError(String),
}

/// Coarse error categories driving retry and shutdown decisions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Connectivity, timeout or non-2xx status; retried
    Transport,
    /// Credentials rejected; requires operator action
    Auth,
    /// Malformed or unexpected payload; message discarded
    Decode,
    /// Invalid settings; fatal at startup
    Config,
}

impl EvccError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::HttpError(_)
            | Self::ApiError { .. }
            | Self::Timeout
            | Self::WebSocket(_)
            | Self::CommandFailed { .. } => ErrorKind::Transport,
            Self::AuthenticationFailed(_) => ErrorKind::Auth,
            Self::InvalidPayload(_) => ErrorKind::Decode,
            Self::ConfigError(_) => ErrorKind::Config,
        }
    }

    pub fn is_transient(&self) -> bool {
        self.kind() == ErrorKind::Transport
    }

    pub fn is_auth(&self) -> bool {
        self.kind() == ErrorKind::Auth
    }
}

pub type EvccResult<T> = Result<T, EvccError>;

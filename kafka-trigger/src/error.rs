use thiserror::Error;

use crate::codec::CodecError;
use crate::coordinator::CoordinatorError;
use crate::dispatch::DeliveryError;
use crate::fetcher::{FetchError, TransportError};
use crate::schema::SchemaError;

#[derive(Error, Debug)]
pub enum TriggerError {
    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error(transparent)]
    Schema(#[from] SchemaError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Fetch(#[from] FetchError),

    #[error(transparent)]
    Coordinator(#[from] CoordinatorError),

    #[error(transparent)]
    Delivery(#[from] DeliveryError),

    #[error("a binding named {0} is already registered")]
    DuplicateBinding(String),
}

// Session-level errors.
//
// The overlay invariant violations signal that the local store and the
// server have desynchronized; they are surfaced to the caller of the event
// handler rather than silently repaired.

use thiserror::Error;

use syncwire_common::types::{DocId, MethodId};

#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("endpoint url must use wss (ws is allowed only for localhost testing)")]
    InsecureEndpoint,

    #[error("invalid endpoint url `{url}`: {source}")]
    InvalidEndpoint { url: String, source: url::ParseError },

    #[error("server added {collection}/{id}, which the client already believes exists")]
    AddedExistingDocument { collection: String, id: DocId },

    #[error("server changed {collection}/{id}, which the client believes does not exist")]
    ChangedMissingDocument { collection: String, id: DocId },

    #[error("server removed {collection}/{id}, which the client believes does not exist")]
    RemovedMissingDocument { collection: String, id: DocId },

    #[error("overlay record lost for {collection}/{id} while method {method_id} was outstanding")]
    OverlayRecordLost { collection: String, id: DocId, method_id: MethodId },

    #[error("{collection}/{id} is not marked as written by method {method_id}")]
    NotWrittenByMethod { collection: String, id: DocId, method_id: MethodId },

    #[error("no invocation is outstanding for method {0}")]
    UnknownMethod(MethodId),

    #[error("a result arrived for method {0}, which already has one")]
    DuplicateResult(MethodId),

    #[error("retired an invocation block that still holds methods")]
    NonEmptyRetiredBlock,

    #[error("a stub is already registered for method `{0}`")]
    DuplicateStub(String),
}

use serde::{Deserialize, Serialize};

use crate::objects::Object;

/// A change notification from the API server watch stream.
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(tag = "type")]
pub enum WatchEvent<T> {
    Put(PutEvent<T>),
    Delete(DeleteEvent),
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct PutEvent<T> {
    pub key: String,
    pub object: T,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct DeleteEvent {
    pub key: String,
}

impl<T: Object> WatchEvent<T> {
    pub fn new_put(object: T) -> Self {
        WatchEvent::Put(PutEvent {
            key: object.key(),
            object,
        })
    }

    pub fn new_delete(key: String) -> Self {
        WatchEvent::Delete(DeleteEvent {
            key,
        })
    }

    pub fn key(&self) -> &str {
        match self {
            WatchEvent::Put(PutEvent {
                key, ..
            }) => key,
            WatchEvent::Delete(DeleteEvent {
                key,
            }) => key,
        }
    }
}

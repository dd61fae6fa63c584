use serde::{Deserialize, Serialize};

pub mod etcd;

/// Envelope of every API server reply.
#[derive(Debug, Serialize, Deserialize)]
pub struct Response<T: Serialize> {
    pub msg: Option<String>,
    pub data: Option<T>,
}

impl<T: Serialize> Response<T> {
    pub fn new(msg: Option<String>, data: Option<T>) -> Self {
        Response {
            msg,
            data,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrResponse {
    pub msg: String,
    pub cause: Option<String>,
}

#![allow(dead_code)]

pub mod helpers;
pub mod pop3_client;
pub mod smtp_client;

pub mod classification;
pub mod dispatcher;
pub mod handler;
pub mod intent;
pub mod openai;
pub mod state;
pub mod transfer;

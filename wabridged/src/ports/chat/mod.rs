pub mod client_port;

pub use client_port::{
    ChatClient, ChatClientError, ChatClientFactory, ClientEvent, ClientEventSink, IncomingCall,
    MessageReceipt, RemoteAuth,
};

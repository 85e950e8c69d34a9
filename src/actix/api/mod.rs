pub mod stream_api;

mod connection;
mod helpers;
mod publishers;

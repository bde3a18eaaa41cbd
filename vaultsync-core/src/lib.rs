mod client;

pub use client::{
    ApiErrorClass, BlobClient, BlobStoreError, RemoteItem, RemoteItemList, RemoteMeta,
};

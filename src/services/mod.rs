pub mod conversion_service;
pub mod image_codec;
pub mod ledger_service;
pub mod object_store;

pub mod pinata_service;

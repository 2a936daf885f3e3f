pub mod name;
pub mod packet;
pub mod record;

pub use name::Name;
pub use packet::{DnsPacketReader, DnsPacketWriter, Flags, Section, HEADER_LEN};
pub use record::{Class, RecordData, ResourceKey, ResourceRecord, RrType};

//! Response field extraction that tolerates bodies the typed decoders reject.

pub mod scan;
pub mod urls;

pub use scan::{ImageInfo, first_image_info, response_field, string_value, unescape};
pub use urls::{file_urls, is_image_url};

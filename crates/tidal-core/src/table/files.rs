//! Parquet encoding of data files.

use crate::config::ParquetCompression;
use crate::Result;
use arrow::record_batch::RecordBatch;
use bytes::Bytes;
use crc32fast::Hasher;
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use parquet::arrow::ArrowWriter;
use parquet::basic::Compression;
use parquet::file::properties::WriterProperties;
use std::io::Cursor;

/// Encode a RecordBatch as a Parquet file.
pub(crate) fn encode_parquet(batch: &RecordBatch, compression: ParquetCompression) -> Result<Bytes> {
    let mut buffer = Cursor::new(Vec::new());

    let compression = match compression {
        ParquetCompression::Snappy => Compression::SNAPPY,
        ParquetCompression::Gzip => Compression::GZIP(Default::default()),
        ParquetCompression::Lz4 => Compression::LZ4,
        ParquetCompression::Zstd => Compression::ZSTD(Default::default()),
        ParquetCompression::None => Compression::UNCOMPRESSED,
    };

    let props = WriterProperties::builder()
        .set_compression(compression)
        .set_max_row_group_size(128 * 1024)
        .build();

    let mut writer = ArrowWriter::try_new(&mut buffer, batch.schema(), Some(props))?;
    writer.write(batch)?;
    writer.close()?;

    Ok(Bytes::from(buffer.into_inner()))
}

/// Decode every row group of a Parquet file.
pub(crate) fn decode_parquet(data: Bytes) -> Result<Vec<RecordBatch>> {
    let reader = ParquetRecordBatchReaderBuilder::try_new(data)?.build()?;
    Ok(reader.collect::<std::result::Result<Vec<_>, _>>()?)
}

/// CRC32 of a file's contents, as lowercase hex.
pub(crate) fn checksum(data: &[u8]) -> String {
    let mut hasher = Hasher::new();
    hasher.update(data);
    format!("{:08x}", hasher.finalize())
}

/*!
 # wikidump-filter

 Stream a bzip2-compressed Wikidata entity dump — a single multi-gigabyte
 JSON array — through a user-supplied filter program, without ever holding
 the decompressed document or the array in memory.

 The pipeline is strictly ordered and pull-based:

 ```text
 Source → Decompressor → Splitter → Filter subprocess → Sink
 ```

 - **Source**: a local file or an HTTP(S) download with `Range`-based
   resume ([`source`]).
 - **Decompressor**: incremental multi-stream bzip2 ([`decompress`]).
 - **Splitter**: boundary-aware splitting of the outer JSON array into one
   raw element per pull, independent of where chunks happen to end
   ([`splitter`]).
 - **Filter**: an external line-oriented program (jq by default) fed by a
   dedicated thread and drained concurrently ([`filter`]).
 - **Sink**: ordered lines to a file or stdout ([`sink`]).

 Resident memory is bounded by the largest single element plus the chunk
 buffers; backpressure propagates through blocking reads and writes on the
 subprocess pipes.

 ## Example

 ```no_run
 use wikidump_filter::{
     core::pipeline::PipelineBuilder,
     filter::{FilterCommand, OutputFormat, SubprocessTransducer},
     sink::OutputSinkBuilder,
     source::FileSource,
     PipelineError,
 };

 fn main() -> Result<(), PipelineError> {
     let pipeline = PipelineBuilder::new()
         .source(FileSource::new("latest-all.json.bz2"))
         .transducer(SubprocessTransducer::new(FilterCommand::jq(
             ".labels.en.value",
             OutputFormat::Json,
         )))
         .sink(OutputSinkBuilder::new().path(Some("labels.ndjson".into())).build()?)
         .build();

     let execution = pipeline.run()?;
     eprintln!("{} entities filtered", execution.elements_read);
     Ok(())
 }
 ```
*/

pub mod core;

pub mod decompress;

pub mod error;

pub mod filter;

pub mod sink;

pub mod source;

pub mod splitter;

pub use error::PipelineError;

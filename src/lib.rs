/*!
Spots VPN tunnels in packet traces without decrypting anything.

An encrypted tunnel cannot hide the *structure* of its framing: length
prefixes, packet counters and opcode bytes sit at fixed offsets in
front of the ciphertext. This crate reads a capture of a single
two-endpoint flow, launders out segmentation noise with a small filter
ensemble, and labels each of the first payload byte columns as stable,
incrementing, length-correlated, high-entropy, zero or unknown. That
label line is the tunnel's shape: OpenVPN, WireGuard and IKEv2/ESP
each leave a characteristic one.

OpenVPN additionally gets a dedicated pass/fail fingerprint built from
its opcode diversity and ACK timing; see [`fingerprint`].

```no_run
use vpnlens::pipeline::{self, PipelineConfig};

# fn main() -> Result<(), vpnlens::pipeline::PipelineError> {
let result = pipeline::run("flow.pcap".as_ref(), &PipelineConfig::default())?;
println!("{}", result.token_line());
# Ok(())
# }
```
*/

pub mod capture;
pub mod classify;
pub mod entropy;
pub mod fields;
pub mod filter;
pub mod fingerprint;
pub mod frame;
pub mod pipeline;
pub mod record;
pub mod time;

pub use capture::{Capture, CaptureError, LinkType, RawFrame};
pub use classify::{ClassificationResult, ClassifierConfig, FieldType};
pub use filter::FilterConfig;
pub use frame::Transport;
pub use pipeline::{PipelineConfig, PipelineError};
pub use record::{Direction, Flow, PacketRecord};

//! Replication of small values across the fabric.
//!
//! Two paths: private broadcast pushes local bytes to the same address on
//! every peer, and the registry broadcast pulls locale 0's global-variable
//! table into every mirror.

use super::message::{Am, AmBytes, PutRequest};
use super::runtime::{CommError, Runtime};
use super::substrate::{Substrate, SubstrateError};
use crate::types::RemoteAddr;

impl<S: Substrate> Runtime<S> {
    /// Replicate the `size` bytes at local `addr` to the same address on
    /// every other locale.
    ///
    /// With segments the bytes ride a PUTDATA frame to each peer; without
    /// them each peer gets a direct put, which relies on the static region
    /// sitting at the same address everywhere. Propagation is eventually
    /// consistent: return means every frame was handed to the substrate, not
    /// that every peer has applied it.
    pub async fn broadcast_private(&self, addr: RemoteAddr, size: usize) -> Result<(), CommError> {
        let mut data = vec![0u8; size];
        self.mem()
            .local()
            .read(addr, &mut data)
            .map_err(|e| self.substrate_err("broadcast source read", e))?;

        if self.mem().has_segments() {
            let payload = AmBytes::new(data)
                .ok_or(CommError::Internal("broadcast payload exceeds the AM payload bound"))?;
            let frame = Am::PutData(PutRequest { addr, data: payload }).encode()?;
            let max = self.substrate().max_am_medium();
            if frame.len() > max {
                let source = SubstrateError::PayloadTooLarge { len: frame.len(), max };
                return Err(self.substrate_err("broadcast putdata", source));
            }
            for locale in 0..self.num_locales() {
                if locale != self.locale_id() {
                    self.substrate()
                        .am_request_medium(locale, &frame)
                        .await
                        .map_err(|e| self.substrate_err("am_request_medium(PUTDATA)", e))?;
                }
            }
        } else {
            for locale in 0..self.num_locales() {
                if locale != self.locale_id() {
                    self.put(locale, addr, &data).await?;
                }
            }
        }
        Ok(())
    }

    /// Mirror locale 0's registry: every non-zero locale gets each of the
    /// root's `num_globals` slots into its own slot of the same index.
    ///
    /// A no-op on locale 0 and for zero globals, where the registry pointer
    /// is null and must not be touched.
    pub async fn broadcast_global_vars(&self, num_globals: u32) -> Result<(), CommError> {
        if num_globals == 0 || self.locale_id() == 0 {
            return Ok(());
        }
        for index in 0..num_globals {
            let src = self.mem().registry_slot_on_root(index)?;
            let dst = self.mem().registry_slot(index)?;
            let mut slot = [0u8; 8];
            self.get(0, src, &mut slot).await?;
            self.mem()
                .local()
                .write(dst, &slot)
                .map_err(|e| self.substrate_err("registry slot store", e))?;
        }
        Ok(())
    }
}

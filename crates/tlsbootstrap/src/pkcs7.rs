//! Minimal DER walk over a PKCS#7 `SignedData` envelope (RFC 2315).
//!
//! The platform metadata service wraps the attested document in a signedData
//! structure. Only the pieces the verifier needs are extracted: the
//! encapsulated content, the bundled certificates, and the single signer's
//! issuer-and-serial identifier. Certificate semantics (chains, names,
//! signatures) are handled by x509-parser on the raw DER this module returns.

const TAG_INTEGER: u8 = 0x02;
const TAG_OCTET_STRING: u8 = 0x04;
const TAG_OID: u8 = 0x06;
const TAG_SEQUENCE: u8 = 0x30;
const TAG_SET: u8 = 0x31;
const TAG_CONTEXT_0: u8 = 0xa0;
const TAG_CONTEXT_1: u8 = 0xa1;

/// 1.2.840.113549.1.7.2 (pkcs7-signedData)
const OID_SIGNED_DATA: &[u8] = &[0x2a, 0x86, 0x48, 0x86, 0xf7, 0x0d, 0x01, 0x07, 0x02];

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum Pkcs7Error {
	#[error("truncated DER structure")]
	Truncated,
	#[error("unexpected DER tag {got:#04x} (wanted {want:#04x})")]
	UnexpectedTag { want: u8, got: u8 },
	#[error("unsupported DER length encoding")]
	BadLength,
	#[error("not a PKCS#7 signedData envelope")]
	NotSignedData,
	#[error("expected exactly one signer, found {0}")]
	SignerCount(usize),
}

/// The parts of a signedData envelope the attestation verifier consumes.
#[derive(Debug)]
pub struct SignedEnvelope {
	/// Encapsulated content (the attested document JSON).
	pub content: Vec<u8>,
	/// Raw DER of every bundled certificate.
	pub certificates: Vec<Vec<u8>>,
	/// Identifier of the one signer.
	pub signer: SignerIdentifier,
}

/// issuerAndSerialNumber of a SignerInfo.
#[derive(Debug, Clone)]
pub struct SignerIdentifier {
	/// DER-encoded issuer Name (full TLV).
	pub issuer: Vec<u8>,
	/// Serial number content bytes (big-endian, as encoded).
	pub serial: Vec<u8>,
}

pub fn parse(der: &[u8]) -> Result<SignedEnvelope, Pkcs7Error> {
	// ContentInfo ::= SEQUENCE { contentType OID, content [0] EXPLICIT ANY }
	let mut outer = Reader::new(der);
	let mut content_info = Reader::new(outer.expect(TAG_SEQUENCE)?);
	let content_type = content_info.expect(TAG_OID)?;
	if content_type != OID_SIGNED_DATA {
		return Err(Pkcs7Error::NotSignedData);
	}
	let mut wrapper = Reader::new(content_info.expect(TAG_CONTEXT_0)?);

	// SignedData ::= SEQUENCE { version, digestAlgorithms, contentInfo,
	//   certificates [0] IMPLICIT OPTIONAL, crls [1] IMPLICIT OPTIONAL,
	//   signerInfos SET }
	let mut signed_data = Reader::new(wrapper.expect(TAG_SEQUENCE)?);
	signed_data.expect(TAG_INTEGER)?;
	signed_data.expect(TAG_SET)?;

	let mut encap = Reader::new(signed_data.expect(TAG_SEQUENCE)?);
	encap.expect(TAG_OID)?;
	let content = if encap.done() {
		Vec::new()
	} else {
		let mut explicit = Reader::new(encap.expect(TAG_CONTEXT_0)?);
		explicit.expect(TAG_OCTET_STRING)?.to_vec()
	};

	let mut certificates = Vec::new();
	if signed_data.peek() == Some(TAG_CONTEXT_0) {
		let mut certs = Reader::new(signed_data.expect(TAG_CONTEXT_0)?);
		while !certs.done() {
			certificates.push(certs.read_raw(TAG_SEQUENCE)?.to_vec());
		}
	}
	if signed_data.peek() == Some(TAG_CONTEXT_1) {
		signed_data.expect(TAG_CONTEXT_1)?;
	}

	let mut signer_infos = Reader::new(signed_data.expect(TAG_SET)?);
	let mut signers = Vec::new();
	while !signer_infos.done() {
		signers.push(signer_infos.expect(TAG_SEQUENCE)?);
	}
	if signers.len() != 1 {
		return Err(Pkcs7Error::SignerCount(signers.len()));
	}

	// SignerInfo ::= SEQUENCE { version, issuerAndSerialNumber, ... }
	let mut signer_info = Reader::new(signers[0]);
	signer_info.expect(TAG_INTEGER)?;
	let mut sid = Reader::new(signer_info.expect(TAG_SEQUENCE)?);
	let issuer = sid.read_raw(TAG_SEQUENCE)?.to_vec();
	let serial = sid.expect(TAG_INTEGER)?.to_vec();

	Ok(SignedEnvelope {
		content,
		certificates,
		signer: SignerIdentifier { issuer, serial },
	})
}

struct Reader<'a> {
	input: &'a [u8],
	pos: usize,
}

impl<'a> Reader<'a> {
	fn new(input: &'a [u8]) -> Self {
		Reader { input, pos: 0 }
	}

	fn done(&self) -> bool {
		self.pos >= self.input.len()
	}

	fn peek(&self) -> Option<u8> {
		self.input.get(self.pos).copied()
	}

	/// Read one TLV, requiring `want` as the tag. Returns the value bytes.
	fn expect(&mut self, want: u8) -> Result<&'a [u8], Pkcs7Error> {
		let (tag, header_len, value_len) = self.header()?;
		if tag != want {
			return Err(Pkcs7Error::UnexpectedTag { want, got: tag });
		}
		let start = self.pos + header_len;
		let end = start + value_len;
		if end > self.input.len() {
			return Err(Pkcs7Error::Truncated);
		}
		self.pos = end;
		Ok(&self.input[start..end])
	}

	/// Read one TLV, requiring `want` as the tag. Returns the complete
	/// encoding including the header, for re-parsing by x509-parser or for
	/// byte-wise Name comparison.
	fn read_raw(&mut self, want: u8) -> Result<&'a [u8], Pkcs7Error> {
		let (tag, header_len, value_len) = self.header()?;
		if tag != want {
			return Err(Pkcs7Error::UnexpectedTag { want, got: tag });
		}
		let start = self.pos;
		let end = start + header_len + value_len;
		if end > self.input.len() {
			return Err(Pkcs7Error::Truncated);
		}
		self.pos = end;
		Ok(&self.input[start..end])
	}

	/// Decode the tag and length at the cursor without advancing.
	/// Returns (tag, header length, value length).
	fn header(&self) -> Result<(u8, usize, usize), Pkcs7Error> {
		let tag = *self.input.get(self.pos).ok_or(Pkcs7Error::Truncated)?;
		if tag & 0x1f == 0x1f {
			// Multi-byte tags never appear in signedData.
			return Err(Pkcs7Error::BadLength);
		}
		let first = *self.input.get(self.pos + 1).ok_or(Pkcs7Error::Truncated)?;
		if first < 0x80 {
			return Ok((tag, 2, first as usize));
		}
		let n = (first & 0x7f) as usize;
		// 0x80 is the BER indefinite form; DER forbids it, and anything past
		// four length octets exceeds any plausible envelope.
		if n == 0 || n > 4 {
			return Err(Pkcs7Error::BadLength);
		}
		let mut len = 0usize;
		for i in 0..n {
			let byte = *self.input.get(self.pos + 2 + i).ok_or(Pkcs7Error::Truncated)?;
			len = (len << 8) | byte as usize;
		}
		Ok((tag, 2 + n, len))
	}
}

#[cfg(test)]
#[path = "pkcs7_tests.rs"]
mod tests;

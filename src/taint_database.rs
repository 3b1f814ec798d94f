use crate::error::{Error, Result};
use itertools::Itertools;
use log::{debug, trace};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::convert::TryInto;
use std::fs::File;
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::iter::FromIterator;
use std::path::Path;

/// Width in bytes of every name field in the metadata file (function names
/// and callee names). Names are NUL-padded.
pub const FUNC_NAME_LEN: usize = 256;

/// Taint facts for one call site: which argument positions were tainted
/// before and after the call, and which functions it may call.
#[derive(PartialEq, Eq, Clone, Debug, Default)]
pub struct CallSiteTaint {
    /// Argument positions tainted going into the call (MSB-first, see
    /// `arg_resolver`)
    pub in_taint_bits: u32,
    /// Argument positions tainted once the call returns
    pub out_taint_bits: u32,
    /// Names of the possible callees
    pub callees: BTreeSet<String>,
}

/// Taint facts for one function
#[derive(PartialEq, Eq, Clone, Debug, Default)]
pub struct FunctionTaintFacts {
    /// Ids (dense, 0-based, program order) of the instructions to instrument
    pub tainted_instruction_ids: BTreeSet<usize>,
    /// Map from instruction id to the taint facts for the call at that id
    pub call_site_taint: BTreeMap<usize, CallSiteTaint>,
}

impl FunctionTaintFacts {
    pub fn is_inst_tainted(&self, inst_id: usize) -> bool {
        self.tainted_instruction_ids.contains(&inst_id)
    }

    pub fn get_call_site_taint(&self, inst_id: usize) -> Option<&CallSiteTaint> {
        self.call_site_taint.get(&inst_id)
    }

    /// Fold another block for the same function into this one.
    /// Instruction ids are unioned. For a call site seen twice, the later bit
    /// pair wins and the callee sets are unioned.
    fn merge(&mut self, other: FunctionTaintFacts) {
        self.tainted_instruction_ids.extend(other.tainted_instruction_ids);
        for (inst_id, cst) in other.call_site_taint {
            let entry = self.call_site_taint.entry(inst_id).or_default();
            entry.in_taint_bits = cst.in_taint_bits;
            entry.out_taint_bits = cst.out_taint_bits;
            entry.callees.extend(cst.callees);
        }
    }
}

/// The taint facts for every function the analysis reported on.
/// Immutable once loaded.
#[derive(PartialEq, Eq, Clone, Debug, Default)]
pub struct TaintDatabase {
    /// Map from function name to the facts for that function
    functions: HashMap<String, FunctionTaintFacts>,
}

impl TaintDatabase {
    /// Load the database from the metadata file at `path`.
    ///
    /// Any short read fails the whole load; no partial database is returned.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        debug!("Loading taint metadata from {:?}", path);
        let file = File::open(path)?;
        Self::decode(BufReader::new(file))
    }

    /// Decode a database from raw metadata bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        Self::decode(bytes)
    }

    /// Decode a database from any reader positioned at the start of the
    /// metadata.
    pub fn decode(reader: impl Read) -> Result<Self> {
        let mut decoder = Decoder { reader };
        let num_functions = decoder.read_u32("function count")?;
        debug!("Taint metadata describes {} function(s)", num_functions);

        let mut db = Self::default();
        for fn_idx in 0 .. num_functions {
            let (name, facts) = decoder.read_function_block(fn_idx)?;
            debug!(
                "Loaded function {:?}: {} tainted instruction(s), {} call site(s)",
                name,
                facts.tainted_instruction_ids.len(),
                facts.call_site_taint.len(),
            );
            db.functions.entry(name).or_default().merge(facts);
        }
        Ok(db)
    }

    /// Encode the database in the metadata file format.
    /// Functions are written in name order, so equal databases encode to
    /// equal bytes.
    pub fn encode(&self, mut writer: impl Write) -> Result<()> {
        write_count(&mut writer, self.functions.len(), "function count")?;
        for (name, facts) in self.functions.iter().sorted_by(|a, b| a.0.cmp(b.0)) {
            write_name(&mut writer, name)?;
            write_count(&mut writer, facts.tainted_instruction_ids.len(), "tainted instruction count")?;
            write_count(&mut writer, facts.call_site_taint.len(), "call site count")?;
            for &inst_id in &facts.tainted_instruction_ids {
                write_count(&mut writer, inst_id, "instruction id")?;
            }
            for (&inst_id, cst) in &facts.call_site_taint {
                write_count(&mut writer, inst_id, "call site instruction id")?;
                writer.write_all(&cst.in_taint_bits.to_le_bytes())?;
                writer.write_all(&cst.out_taint_bits.to_le_bytes())?;
                write_count(&mut writer, cst.callees.len(), "callee count")?;
                for callee in &cst.callees {
                    write_name(&mut writer, callee)?;
                }
            }
        }
        writer.flush()?;
        Ok(())
    }

    /// Encode the database into a fresh byte vector
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let mut bytes = Vec::new();
        self.encode(&mut bytes)?;
        Ok(bytes)
    }

    /// Write the database to a metadata file at `path`
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let file = File::create(path.as_ref())?;
        self.encode(BufWriter::new(file))
    }

    /// Get the facts for the function with the given name, if the analysis
    /// reported on it
    pub fn lookup(&self, function_name: &str) -> Option<&FunctionTaintFacts> {
        self.functions.get(function_name)
    }

    /// Iterate over the names of all functions in the database
    pub fn function_names(&self) -> impl Iterator<Item = &str> {
        self.functions.keys().map(|s| s.as_str())
    }

    pub fn len(&self) -> usize {
        self.functions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.functions.is_empty()
    }
}

impl FromIterator<(String, FunctionTaintFacts)> for TaintDatabase {
    fn from_iter<I: IntoIterator<Item = (String, FunctionTaintFacts)>>(iter: I) -> Self {
        let mut db = Self::default();
        for (name, facts) in iter {
            db.functions.entry(name).or_default().merge(facts);
        }
        db
    }
}

struct Decoder<R> {
    reader: R,
}

impl<R: Read> Decoder<R> {
    /// Fill `buf` completely, or fail naming the section being read
    fn read_exact(&mut self, buf: &mut [u8], what: &str) -> Result<()> {
        self.reader.read_exact(buf).map_err(|e| match e.kind() {
            io::ErrorKind::UnexpectedEof => Error::file_format(format!("truncated while reading {}", what)),
            _ => Error::Io(e),
        })
    }

    fn read_u32(&mut self, what: &str) -> Result<u32> {
        let mut buf = [0; 4];
        self.read_exact(&mut buf, what)?;
        Ok(u32::from_le_bytes(buf))
    }

    fn read_name(&mut self, what: &str) -> Result<String> {
        let mut buf = [0; FUNC_NAME_LEN];
        self.read_exact(&mut buf, what)?;
        let len = buf.iter().position(|&b| b == 0).unwrap_or(FUNC_NAME_LEN);
        String::from_utf8(buf[.. len].to_vec())
            .map_err(|_| Error::file_format(format!("{} is not valid UTF-8", what)))
    }

    fn read_function_block(&mut self, fn_idx: u32) -> Result<(String, FunctionTaintFacts)> {
        let name = self.read_name(&format!("name of function #{}", fn_idx))?;
        let num_tainted = self.read_u32(&format!("tainted instruction count of {:?}", name))?;
        let num_call_sites = self.read_u32(&format!("call site count of {:?}", name))?;

        let mut facts = FunctionTaintFacts::default();
        for _ in 0 .. num_tainted {
            let inst_id = self.read_u32(&format!("tainted instruction ids of {:?}", name))?;
            trace!("{:?}: tainted instruction {}", name, inst_id);
            facts.tainted_instruction_ids.insert(inst_id as usize);
        }

        for _ in 0 .. num_call_sites {
            let what = format!("call site block of {:?}", name);
            let inst_id = self.read_u32(&what)? as usize;
            let in_taint_bits = self.read_u32(&what)?;
            let out_taint_bits = self.read_u32(&what)?;
            let num_callees = self.read_u32(&what)?;
            let mut callees = BTreeSet::new();
            for _ in 0 .. num_callees {
                callees.insert(self.read_name(&format!("callee name of {:?} call site {}", name, inst_id))?);
            }
            trace!(
                "{:?}: call site {} in {:#010x} out {:#010x} callees {:?}",
                name, inst_id, in_taint_bits, out_taint_bits, callees,
            );
            let entry = facts.call_site_taint.entry(inst_id).or_default();
            entry.in_taint_bits = in_taint_bits;
            entry.out_taint_bits = out_taint_bits;
            entry.callees.extend(callees);
        }
        Ok((name, facts))
    }
}

fn write_count(writer: &mut impl Write, count: usize, what: &str) -> Result<()> {
    let count: u32 = count
        .try_into()
        .map_err(|_| Error::file_format(format!("{} {} does not fit in 32 bits", what, count)))?;
    writer.write_all(&count.to_le_bytes())?;
    Ok(())
}

fn write_name(writer: &mut impl Write, name: &str) -> Result<()> {
    // leave room for the terminating NUL
    if name.len() >= FUNC_NAME_LEN || name.as_bytes().contains(&0) {
        return Err(Error::file_format(format!(
            "name {:?} does not fit in a {}-byte name field",
            name, FUNC_NAME_LEN,
        )));
    }
    let mut buf = [0; FUNC_NAME_LEN];
    buf[.. name.len()].copy_from_slice(name.as_bytes());
    writer.write_all(&buf)?;
    Ok(())
}

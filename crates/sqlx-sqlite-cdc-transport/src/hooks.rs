//! SQLite native hook registration for capturing row changes.
//!
//! Low-level bindings to SQLite's preupdate_hook, commit_hook and rollback_hook.
//! The hooks feed a [`HookDispatcher`], which owns the transaction semantics.
//!
//! # SQLite Requirements
//!
//! The preupdate hook requires SQLite compiled with `SQLITE_ENABLE_PREUPDATE_HOOK`.
//! Use [`is_preupdate_hook_enabled()`] to check at runtime.

use std::ffi::{CStr, c_int, c_void};
use std::panic::catch_unwind;
use std::ptr;
use std::sync::Arc;

use libsqlite3_sys::{
   SQLITE_BLOB, SQLITE_DELETE, SQLITE_FLOAT, SQLITE_INSERT, SQLITE_INTEGER, SQLITE_NULL,
   SQLITE_TEXT, SQLITE_UPDATE, sqlite3, sqlite3_commit_hook, sqlite3_compileoption_used,
   sqlite3_preupdate_count, sqlite3_preupdate_hook, sqlite3_preupdate_new, sqlite3_preupdate_old,
   sqlite3_rollback_hook, sqlite3_value, sqlite3_value_blob, sqlite3_value_bytes,
   sqlite3_value_double, sqlite3_value_int64, sqlite3_value_text, sqlite3_value_type,
};
use tracing::{debug, error, trace};

use crate::change::{ChangeOperation, ColumnValue};
use crate::dispatch::{HookDispatcher, PendingChange};

/// Which row image to read inside the preupdate callback.
#[derive(Clone, Copy)]
enum Image {
   Old,
   New,
}

/// Extracts a value from a raw sqlite3_value pointer.
///
/// # Safety
///
/// The pointer must be null or point to a properly initialized sqlite3_value that
/// stays valid for the duration of this call.
unsafe fn column_value_from_raw(value: *mut sqlite3_value) -> ColumnValue {
   if value.is_null() {
      return ColumnValue::Null;
   }

   // SAFETY: value is non-null and valid for the duration of the preupdate hook callback.
   match unsafe { sqlite3_value_type(value) } {
      SQLITE_NULL => ColumnValue::Null,
      SQLITE_INTEGER => ColumnValue::Integer(unsafe { sqlite3_value_int64(value) }),
      SQLITE_FLOAT => ColumnValue::Real(unsafe { sqlite3_value_double(value) }),
      SQLITE_TEXT => {
         let text_ptr = unsafe { sqlite3_value_text(value) };
         if text_ptr.is_null() {
            ColumnValue::Null
         } else {
            // SAFETY: SQLite guarantees a null-terminated string
            let cstr = unsafe { CStr::from_ptr(text_ptr as *const _) };
            ColumnValue::Text(cstr.to_string_lossy().into_owned())
         }
      }
      SQLITE_BLOB => {
         let blob_ptr = unsafe { sqlite3_value_blob(value) };
         let len = unsafe { sqlite3_value_bytes(value) } as usize;
         if blob_ptr.is_null() || len == 0 {
            ColumnValue::Blob(Vec::new())
         } else {
            // SAFETY: blob_ptr is non-null and len bytes are valid for the callback duration
            let slice = unsafe { std::slice::from_raw_parts(blob_ptr as *const u8, len) };
            ColumnValue::Blob(slice.to_vec())
         }
      }
      _ => ColumnValue::Null,
   }
}

/// Reads one full row image inside a preupdate callback.
///
/// # Safety
///
/// Must only be called from within a preupdate callback for `db`, with `image`
/// valid for the operation being reported.
unsafe fn read_image(db: *mut sqlite3, column_count: usize, image: Image) -> Vec<ColumnValue> {
   let mut values = Vec::with_capacity(column_count);
   for i in 0..column_count {
      let mut value: *mut sqlite3_value = ptr::null_mut();
      // SAFETY: db is valid, i is in range [0, column_count)
      let rc = unsafe {
         match image {
            Image::Old => sqlite3_preupdate_old(db, i as c_int, &mut value),
            Image::New => sqlite3_preupdate_new(db, i as c_int, &mut value),
         }
      };
      if rc == 0 {
         // SAFETY: value was populated by sqlite3_preupdate_old/new
         values.push(unsafe { column_value_from_raw(value) });
      } else {
         values.push(ColumnValue::Null);
      }
   }
   values
}

/// Context data passed to SQLite hook callbacks.
///
/// Stored as the user_data pointer; the Arc keeps the dispatcher alive while hooks
/// are registered.
struct HookContext {
   dispatcher: Arc<HookDispatcher>,
}

/// Checks if the linked SQLite library was compiled with `SQLITE_ENABLE_PREUPDATE_HOOK`.
///
/// # Example
///
/// ```rust
/// use sqlx_sqlite_cdc_transport::is_preupdate_hook_enabled;
///
/// if !is_preupdate_hook_enabled() {
///     panic!("SQLite was not compiled with SQLITE_ENABLE_PREUPDATE_HOOK");
/// }
/// ```
pub fn is_preupdate_hook_enabled() -> bool {
   let opt_name = c"ENABLE_PREUPDATE_HOOK";
   unsafe { sqlite3_compileoption_used(opt_name.as_ptr()) == 1 }
}

/// Registers all three hooks on a raw SQLite connection.
///
/// # Safety
///
/// - `db` must be a valid pointer to an open sqlite3 connection
/// - Must be paired with exactly one [`unregister_hooks`] call for `db`
/// - Must not race with statements executing on the same connection
pub(crate) unsafe fn register_hooks(
   db: *mut sqlite3,
   dispatcher: Arc<HookDispatcher>,
) -> crate::Result<()> {
   if !is_preupdate_hook_enabled() {
      return Err(crate::Error::HookRegistration(
         "SQLite was not compiled with SQLITE_ENABLE_PREUPDATE_HOOK. \
             Ensure you're using a SQLite build with preupdate hook support, \
             or enable the 'bundled' feature."
            .to_string(),
      ));
   }

   debug!("Registering SQLite change hooks");

   // SQLite does not own user_data; the box is reclaimed in unregister_hooks from the
   // pointer sqlite3_preupdate_hook hands back.
   let context_ptr = Box::into_raw(Box::new(HookContext { dispatcher })) as *mut c_void;

   // SAFETY: db is a valid sqlite3 pointer (guaranteed by caller). All hooks share
   // context_ptr, which stays valid until unregister_hooks.
   unsafe {
      sqlite3_preupdate_hook(db, Some(preupdate_callback), context_ptr);
      sqlite3_commit_hook(db, Some(commit_callback), context_ptr);
      sqlite3_rollback_hook(db, Some(rollback_callback), context_ptr);
   }

   trace!("SQLite hooks registered");
   Ok(())
}

/// Removes all three hooks and frees the context allocated by [`register_hooks`].
///
/// # Safety
///
/// - `db` must be the same valid sqlite3 pointer passed to `register_hooks`
/// - Must not be called concurrently with hook callbacks
pub(crate) unsafe fn unregister_hooks(db: *mut sqlite3) {
   // SAFETY: null callback + null user_data removes each hook; the preupdate hook
   // returns the previous user_data, which is our leaked HookContext.
   let prev_user_data = unsafe { sqlite3_preupdate_hook(db, None, ptr::null_mut()) };
   unsafe {
      sqlite3_commit_hook(db, None, ptr::null_mut());
      sqlite3_rollback_hook(db, None, ptr::null_mut());
   }

   if !prev_user_data.is_null() {
      // SAFETY: prev_user_data was created by Box::into_raw in register_hooks
      drop(unsafe { Box::from_raw(prev_user_data as *mut HookContext) });
      trace!("SQLite hooks unregistered and context freed");
   }
}

/// Preupdate hook: captures row images for INSERT, UPDATE and DELETE on routed tables.
unsafe extern "C" fn preupdate_callback(
   user_data: *mut c_void,
   db: *mut sqlite3,
   op: c_int,
   _database: *const std::ffi::c_char,
   table: *const std::ffi::c_char,
   old_rowid: i64,
   new_rowid: i64,
) {
   if user_data.is_null() || table.is_null() {
      return;
   }

   // Unwinding across the FFI boundary is UB.
   let result = catch_unwind(|| {
      // SAFETY: user_data is the HookContext created in register_hooks.
      let context = unsafe { &*(user_data as *const HookContext) };

      // SAFETY: table is a non-null C string provided by SQLite for this callback.
      let Ok(table_name) = unsafe { CStr::from_ptr(table) }.to_str() else {
         return;
      };

      if !context.dispatcher.is_routed(table_name) {
         return;
      }

      let operation = match op {
         SQLITE_INSERT => ChangeOperation::Insert,
         SQLITE_UPDATE => ChangeOperation::Update,
         SQLITE_DELETE => ChangeOperation::Delete,
         _ => return,
      };

      trace!(table = %table_name, ?operation, old_rowid, new_rowid, "Preupdate hook fired");

      // SAFETY: db is the connection this callback fired on.
      let column_count = unsafe { sqlite3_preupdate_count(db) };
      if column_count < 0 {
         error!("Failed to get column count in preupdate hook");
         return;
      }
      let column_count = column_count as usize;

      // SAFETY: old image exists for UPDATE/DELETE, new image for INSERT/UPDATE.
      let old_values = matches!(operation, ChangeOperation::Update | ChangeOperation::Delete)
         .then(|| unsafe { read_image(db, column_count, Image::Old) });
      let new_values = matches!(operation, ChangeOperation::Insert | ChangeOperation::Update)
         .then(|| unsafe { read_image(db, column_count, Image::New) });

      context.dispatcher.on_preupdate(PendingChange {
         table: table_name.to_string(),
         operation,
         old_rowid,
         new_rowid,
         old_values,
         new_values,
      });
   });

   if result.is_err() {
      // tracing may have been the source of the panic
      eprintln!("sqlx-sqlite-cdc-transport: panic in preupdate_callback (absorbed)");
   }
}

/// Commit hook: routes buffered changes. Returning 0 lets the commit proceed.
unsafe extern "C" fn commit_callback(user_data: *mut c_void) -> c_int {
   if user_data.is_null() {
      return 0;
   }

   let result = catch_unwind(|| {
      // SAFETY: user_data is the HookContext created in register_hooks.
      let context = unsafe { &*(user_data as *const HookContext) };
      trace!("Commit hook fired");
      context.dispatcher.on_commit();
   });

   if result.is_err() {
      eprintln!("sqlx-sqlite-cdc-transport: panic in commit_callback (absorbed)");
   }

   0
}

/// Rollback hook: discards buffered changes.
unsafe extern "C" fn rollback_callback(user_data: *mut c_void) {
   if user_data.is_null() {
      return;
   }

   let result = catch_unwind(|| {
      // SAFETY: user_data is the HookContext created in register_hooks.
      let context = unsafe { &*(user_data as *const HookContext) };
      trace!("Rollback hook fired");
      context.dispatcher.on_rollback();
   });

   if result.is_err() {
      eprintln!("sqlx-sqlite-cdc-transport: panic in rollback_callback (absorbed)");
   }
}

#[cfg(test)]
mod tests {
   use super::*;

   #[test]
   fn test_column_value_from_null_pointer() {
      let value = unsafe { column_value_from_raw(ptr::null_mut()) };
      assert_eq!(value, ColumnValue::Null);
   }

   #[test]
   fn test_bundled_sqlite_supports_preupdate_hook() {
      assert!(is_preupdate_hook_enabled());
   }
}

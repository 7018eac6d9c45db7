use std::collections::HashSet;
use std::error::Error as StdError;
use std::fmt::Debug;
use std::ops::{Add, AddAssign, Sub};
use std::result::Result as StdResult;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::error::{DriverError, Result, UserCallbackError};

// imports for docs
#[allow(unused)]
use crate::session::SessionConfig;

type BoxError = Box<dyn StdError + Send + Sync>;

/// Opaque server-issued tokens identifying causally consistent database
/// states.
///
/// Passing the bookmarks of one transaction along with a later transaction
/// makes the server wait until the state the bookmarks describe has been
/// established, forming a causal chain.
///
/// ```
/// use std::collections::HashSet;
///
/// use boltdrive::bookmarks::Bookmarks;
///
/// let bm1 = Bookmarks::from_raw(["a".to_string(), "b".to_string()]);
/// let bm2 = Bookmarks::from_raw(["b".to_string(), "c".to_string()]);
///
/// let all = &bm1 + &bm2;
/// assert_eq!(all.raw().collect::<HashSet<_>>(), HashSet::from(["a", "b", "c"]));
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Bookmarks {
    bookmarks: HashSet<Arc<String>>,
}

impl Bookmarks {
    /// Build bookmarks from raw string tokens without validation.
    ///
    /// Mainly intended for deserialization of previously obtained bookmarks.
    pub fn from_raw(raw: impl IntoIterator<Item = String>) -> Self {
        Bookmarks {
            bookmarks: raw.into_iter().map(Arc::new).collect(),
        }
    }

    /// Build bookmarks from raw string tokens.
    ///
    /// Bookmark tokens are ASCII by construction; a non-ASCII token is a sign
    /// of data corruption and rejected with [`DriverError::InvalidConfig`].
    pub fn try_from_raw(raw: impl IntoIterator<Item = String>) -> Result<Self> {
        let bookmarks = raw
            .into_iter()
            .map(|bm| {
                if !bm.is_ascii() {
                    return Err(DriverError::invalid_config(format!(
                        "bookmarks must be ASCII, found {bm:?}"
                    )));
                }
                Ok(Arc::new(bm))
            })
            .collect::<Result<_>>()?;
        Ok(Bookmarks { bookmarks })
    }

    pub fn len(&self) -> usize {
        self.bookmarks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bookmarks.is_empty()
    }

    /// Iterate over the raw bookmark tokens.
    pub fn raw(&self) -> impl Iterator<Item = &str> {
        self.bookmarks.iter().map(|bm| bm.as_str())
    }

    /// Turn the bookmarks into raw string tokens.
    pub fn into_raw(self) -> impl Iterator<Item = String> {
        self.bookmarks
            .into_iter()
            .map(|bm| Arc::try_unwrap(bm).unwrap_or_else(|bm| String::from(&*bm)))
    }
}

impl Add<&Bookmarks> for &Bookmarks {
    type Output = Bookmarks;

    fn add(self, rhs: &Bookmarks) -> Self::Output {
        #[allow(clippy::suspicious_arithmetic_impl)]
        Bookmarks {
            bookmarks: &self.bookmarks | &rhs.bookmarks,
        }
    }
}

impl Add<&Bookmarks> for Bookmarks {
    type Output = Bookmarks;

    fn add(mut self, rhs: &Bookmarks) -> Self::Output {
        self.bookmarks.extend(rhs.bookmarks.iter().map(Arc::clone));
        self
    }
}

impl AddAssign<&Bookmarks> for Bookmarks {
    fn add_assign(&mut self, rhs: &Bookmarks) {
        self.bookmarks.extend(rhs.bookmarks.iter().map(Arc::clone));
    }
}

impl Sub<&Bookmarks> for Bookmarks {
    type Output = Bookmarks;

    fn sub(mut self, rhs: &Bookmarks) -> Self::Output {
        for bm in &rhs.bookmarks {
            self.bookmarks.remove(bm);
        }
        self
    }
}

/// Tracks bookmarks across sessions for automatic causal chaining.
///
/// All work configured with the same manager becomes part of one causal
/// chain. Implementations must be internally synchronized and must not call
/// back into the driver they are used with (deadlock).
pub trait BookmarkManager: Debug + Send + Sync {
    /// Called before work to collect the bookmarks to send.
    ///
    /// Failures surface as [`DriverError::UserCallback`] with
    /// [`UserCallbackError::BookmarkManagerGet`]; the transaction will not
    /// have taken place.
    fn get_bookmarks(&self) -> StdResult<Arc<Bookmarks>, BoxError>;

    /// Called after each successful commit with the bookmarks previously
    /// handed out (`previous`) and the ones the server returned (`new`).
    ///
    /// Failures surface as [`DriverError::UserCallback`] with
    /// [`UserCallbackError::BookmarkManagerUpdate`]; the transaction will
    /// already have taken place.
    fn update_bookmarks(
        &self,
        previous: Arc<Bookmarks>,
        new: Arc<Bookmarks>,
    ) -> StdResult<(), BoxError>;
}

pub mod bookmark_managers {
    use super::*;

    type DefaultSupplier = fn() -> StdResult<Arc<Bookmarks>, BoxError>;
    type DefaultConsumer = fn(Arc<Bookmarks>) -> StdResult<(), BoxError>;

    /// Pass this for `supplier` in [`with_callbacks()`] to not use one.
    pub const NONE_SUPPLIER: Option<DefaultSupplier> = None;
    /// Pass this for `consumer` in [`with_callbacks()`] to not use one.
    pub const NONE_CONSUMER: Option<DefaultConsumer> = None;

    /// A plain [`BookmarkManager`] tracking a bookmark set.
    pub fn simple(initial_bookmarks: Option<Arc<Bookmarks>>) -> impl BookmarkManager {
        TrackingBookmarkManager {
            bookmarks: RwLock::new(initial_bookmarks.unwrap_or_default()),
            supplier: NONE_SUPPLIER,
            consumer: NONE_CONSUMER,
        }
    }

    /// A [`BookmarkManager`] with hooks: `supplier` contributes extra
    /// bookmarks to every [`BookmarkManager::get_bookmarks()`] (without
    /// making them part of the tracked set), `consumer` observes the tracked
    /// set after every [`BookmarkManager::update_bookmarks()`].
    ///
    /// Neither hook may call back into the driver the manager is used with.
    pub fn with_callbacks<SF, CF>(
        initial_bookmarks: Option<Arc<Bookmarks>>,
        supplier: Option<SF>,
        consumer: Option<CF>,
    ) -> impl BookmarkManager
    where
        SF: Fn() -> StdResult<Arc<Bookmarks>, BoxError> + Send + Sync + 'static,
        CF: Fn(Arc<Bookmarks>) -> StdResult<(), BoxError> + Send + Sync + 'static,
    {
        TrackingBookmarkManager {
            bookmarks: RwLock::new(initial_bookmarks.unwrap_or_default()),
            supplier,
            consumer,
        }
    }

    pub(crate) fn get_bookmarks(manager: &dyn BookmarkManager) -> Result<Arc<Bookmarks>> {
        manager
            .get_bookmarks()
            .map_err(|err| DriverError::UserCallback {
                error: UserCallbackError::BookmarkManagerGet(err),
            })
    }

    pub(crate) fn update_bookmarks(
        manager: &dyn BookmarkManager,
        previous: Arc<Bookmarks>,
        new: Arc<Bookmarks>,
    ) -> Result<()> {
        manager
            .update_bookmarks(previous, new)
            .map_err(|err| DriverError::UserCallback {
                error: UserCallbackError::BookmarkManagerUpdate(err),
            })
    }

    struct TrackingBookmarkManager<SF, CF> {
        bookmarks: RwLock<Arc<Bookmarks>>,
        supplier: Option<SF>,
        consumer: Option<CF>,
    }

    impl<SF, CF> Debug for TrackingBookmarkManager<SF, CF> {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            f.debug_struct("TrackingBookmarkManager")
                .field("bookmarks", &self.bookmarks)
                .field("supplier", &self.supplier.as_ref().map(|_| "..."))
                .field("consumer", &self.consumer.as_ref().map(|_| "..."))
                .finish()
        }
    }

    impl<SF, CF> BookmarkManager for TrackingBookmarkManager<SF, CF>
    where
        SF: Fn() -> StdResult<Arc<Bookmarks>, BoxError> + Send + Sync + 'static,
        CF: Fn(Arc<Bookmarks>) -> StdResult<(), BoxError> + Send + Sync + 'static,
    {
        fn get_bookmarks(&self) -> StdResult<Arc<Bookmarks>, BoxError> {
            let mut bookmarks = {
                let bookmarks_lock = self.bookmarks.read();
                bookmarks_lock.clone()
            };
            if let Some(supplier) = &self.supplier {
                let supplied_bookmarks = supplier()?;
                bookmarks = Arc::new(&*bookmarks + &*supplied_bookmarks);
            }
            Ok(bookmarks)
        }

        fn update_bookmarks(
            &self,
            previous: Arc<Bookmarks>,
            new: Arc<Bookmarks>,
        ) -> StdResult<(), BoxError> {
            if new.is_empty() {
                return Ok(());
            }
            let mut bookmarks_lock = self.bookmarks.write();
            *bookmarks_lock = Arc::new((**bookmarks_lock).clone() - &*previous + &*new);
            if let Some(consumer) = &self.consumer {
                let bookmarks = bookmarks_lock.clone();
                drop(bookmarks_lock);
                consumer(bookmarks)?;
            }
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    fn bms(bookmarks: &[&str]) -> Bookmarks {
        Bookmarks::from_raw(bookmarks.iter().map(|bm| bm.to_string()))
    }

    #[test]
    fn add_unions() {
        assert_eq!(&bms(&["a", "b"]) + &bms(&["b", "c"]), bms(&["a", "b", "c"]));
        let mut sum = bms(&["a"]);
        sum += &bms(&["b"]);
        assert_eq!(sum, bms(&["a", "b"]));
    }

    #[test]
    fn sub_removes() {
        assert_eq!(bms(&["a", "b", "c"]) - &bms(&["b", "x"]), bms(&["a", "c"]));
    }

    #[test]
    fn non_ascii_bookmarks_are_rejected() {
        assert!(Bookmarks::try_from_raw(["ok".to_string()]).is_ok());
        let res = Bookmarks::try_from_raw(["bäd".to_string()]);
        assert!(matches!(res, Err(DriverError::InvalidConfig { .. })));
    }

    #[test]
    fn manager_composes_supplier_and_tracked_set() {
        let manager = bookmark_managers::with_callbacks(
            Some(Arc::new(bms(&["tracked"]))),
            Some(|| Ok(Arc::new(bms(&["supplied"])))),
            bookmark_managers::NONE_CONSUMER,
        );
        let bookmarks = manager.get_bookmarks().unwrap();
        assert_eq!(*bookmarks, bms(&["tracked", "supplied"]));
        // supplied bookmarks are not added to the tracked set
        let bookmarks = manager.get_bookmarks().unwrap();
        assert_eq!(*bookmarks, bms(&["tracked", "supplied"]));
    }

    #[test]
    fn manager_update_replaces_previous() {
        let consumed: Arc<Mutex<Option<Arc<Bookmarks>>>> = Default::default();
        let manager = bookmark_managers::with_callbacks(
            Some(Arc::new(bms(&["old1", "old2"]))),
            bookmark_managers::NONE_SUPPLIER,
            Some({
                let consumed = Arc::clone(&consumed);
                move |bookmarks| {
                    *consumed.lock().unwrap() = Some(bookmarks);
                    Ok(())
                }
            }),
        );
        manager
            .update_bookmarks(Arc::new(bms(&["old1"])), Arc::new(bms(&["new"])))
            .unwrap();
        let bookmarks = manager.get_bookmarks().unwrap();
        assert_eq!(*bookmarks, bms(&["old2", "new"]));
        assert_eq!(
            **consumed.lock().unwrap().as_ref().unwrap(),
            bms(&["old2", "new"])
        );
    }

    #[test]
    fn manager_ignores_empty_updates() {
        let manager = bookmark_managers::simple(Some(Arc::new(bms(&["a"]))));
        manager
            .update_bookmarks(Arc::new(bms(&["a"])), Arc::new(bms(&[])))
            .unwrap();
        assert_eq!(*manager.get_bookmarks().unwrap(), bms(&["a"]));
    }
}
